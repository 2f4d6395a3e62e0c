use std::collections::HashSet;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use tracing::{info, warn};

use checkin_core::auth::CredentialStore;
use checkin_core::config::{ENV_PASSWORD, ENV_STORE_TOKEN, ENV_USERNAME};
use checkin_core::models::{AttendanceEntry, Event, EventSortColumn, EventStatus, NewEvent, Role};
use checkin_core::store::HttpStore;
use checkin_core::utils::{format_percent, truncate_string};
use checkin_core::{open_cache, CheckInError, CheckInOptions, CheckinApp, Config};

use crate::cli::{Cli, Commands, EventCommands, UserCommands};

/// How long to wait for background writes before exiting.
const SETTLE_QUIET_MS: u64 = 500;

/// Poll interval for the watch loop.
const WATCH_TICK_SECS: u64 = 1;

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });
    if let Some(url) = cli.store {
        config.store_url = Some(url);
    }

    let mut app = build_app(config)?;

    match cli.command {
        Commands::Login { username, remember } => login(&mut app, username, remember).await,
        Commands::Logout { purge, forget } => logout(&mut app, purge, forget),
        Commands::Whoami => whoami(&app),
        Commands::Events {
            all,
            search,
            sort,
            desc,
            offline,
        } => list_events(&mut app, all, search, &sort, desc, offline).await,
        Commands::Event { command } => event_command(&mut app, command).await,
        Commands::Scan {
            event_id,
            ids,
            group,
            allow_conflicts,
        } => scan(&mut app, &event_id, ids, group.as_deref(), allow_conflicts).await,
        Commands::Remove { event_id, id_number } => remove(&mut app, &event_id, &id_number).await,
        Commands::Entries { event_id } => entries(&mut app, &event_id).await,
        Commands::Conflicts => conflicts(&mut app).await,
        Commands::Stats { event_id } => stats(&mut app, &event_id).await,
        Commands::Recount { event_id } => recount(&mut app, &event_id).await,
        Commands::Watch { event_id } => watch(&mut app, &event_id).await,
        Commands::User { command } => user_command(&mut app, command).await,
    }
}

fn build_app(config: Config) -> Result<CheckinApp> {
    let mut store = HttpStore::new(config.store_url()?)?;
    if let Ok(token) = std::env::var(ENV_STORE_TOKEN) {
        store.set_token(token);
    }
    let cache = open_cache(&config)?;
    Ok(CheckinApp::new(Arc::new(store), config, cache))
}

// ===== Session =====

fn resolve_password(username: &str) -> Result<String> {
    if let Ok(password) = std::env::var(ENV_PASSWORD) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    if CredentialStore::has_credentials(username) {
        match CredentialStore::get_password(username) {
            Ok(password) => return Ok(password),
            Err(e) => warn!(error = %e, "Stored password unavailable"),
        }
    }
    rpassword::prompt_password(format!("Password for {}: ", username))
        .context("Failed to read password")
}

async fn login(app: &mut CheckinApp, username: Option<String>, remember: bool) -> Result<()> {
    let username = username
        .or_else(|| std::env::var(ENV_USERNAME).ok())
        .or_else(|| app.config().last_username.clone())
        .ok_or_else(|| anyhow!("No username given"))?;
    let password = resolve_password(&username)?;

    let session = app.login(&username, &password).await?;
    if remember {
        CredentialStore::store(&session.username, &password)?;
    }
    if let Err(e) = app.config().save() {
        warn!(error = %e, "Failed to save config");
    }

    let roles: Vec<String> = session.roles.iter().map(|r| r.to_string()).collect();
    println!("Logged in as {} ({})", session.username, roles.join(", "));
    Ok(())
}

fn logout(app: &mut CheckinApp, purge: bool, forget: bool) -> Result<()> {
    let username = app.session().username().map(str::to_string);
    app.logout();
    if purge {
        app.clear_cache()?;
    }
    if forget {
        if let Some(username) = username {
            CredentialStore::delete(&username)?;
        }
    }
    println!("Logged out");
    Ok(())
}

fn whoami(app: &CheckinApp) -> Result<()> {
    let Some(data) = app.session().data.as_ref().filter(|d| !d.is_expired()) else {
        println!("Not logged in");
        return Ok(());
    };
    let roles: Vec<String> = data.roles.iter().map(|r| r.to_string()).collect();
    println!("{} ({})", data.username, roles.join(", "));
    if data.needs_refresh() {
        println!("Session expires in {} minutes", data.minutes_until_expiry());
    }
    println!(
        "Cache {} ({})",
        app.cache().cache_dir().display(),
        if app.cache().is_encrypted() { "encrypted" } else { "plain" }
    );
    Ok(())
}

// ===== Events =====

async fn list_events(
    app: &mut CheckinApp,
    all: bool,
    search: Option<String>,
    sort: &str,
    desc: bool,
    offline: bool,
) -> Result<()> {
    let column: EventSortColumn = sort.parse().map_err(|e: String| anyhow!(e))?;

    let refreshed = if offline {
        false
    } else {
        match app.refresh_events().await {
            Ok(count) => {
                info!(count, "Events refreshed");
                true
            }
            Err(e) => {
                warn!(error = %e, "Event refresh failed, using cache");
                false
            }
        }
    };
    if !refreshed {
        if !app.load_from_cache() {
            bail!("No cached events - connect to the store and try again");
        }
        println!("(cached {})", app.cache_ages.events_age());
    }

    let matching: HashSet<&str> = app
        .events()
        .search(search.as_deref().unwrap_or(""))
        .into_iter()
        .map(|e| e.id.as_str())
        .collect();

    for event in app.events().sorted(column, !desc) {
        if !matching.contains(event.id.as_str()) || (!all && !event.is_active()) {
            continue;
        }
        print_event(event);
    }
    Ok(())
}

fn print_event(event: &Event) {
    println!(
        "{:<36}  {:<28}  {:<32}  {:>9}  {:>6}  {}",
        event.id,
        truncate_string(&event.name, 28),
        event.formatted_window(),
        event.count_summary(),
        format_percent(event.fill_percent()),
        event.status
    );
}

fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M")
        .with_context(|| format!("Unrecognized time: {}", input))?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("Ambiguous local time: {}", input))
}

fn parse_group(input: &str) -> Result<(String, u32)> {
    let (name, count) = input
        .split_once('=')
        .ok_or_else(|| anyhow!("Group must be NAME=COUNT: {}", input))?;
    let count = count
        .trim()
        .parse()
        .with_context(|| format!("Invalid group count: {}", input))?;
    Ok((name.trim().to_string(), count))
}

async fn event_command(app: &mut CheckinApp, command: EventCommands) -> Result<()> {
    match command {
        EventCommands::Create {
            name,
            start,
            end,
            target,
            groups,
        } => {
            let groups = groups
                .iter()
                .map(|g| parse_group(g))
                .collect::<Result<Vec<_>>>()?;
            let event = app
                .create_event(NewEvent {
                    name,
                    target_count: target,
                    start: parse_time(&start)?,
                    end: parse_time(&end)?,
                    groups,
                })
                .await?;
            println!("Created {}", event.id);
            print_event(&event);
        }
        EventCommands::Status { event_id, status } => {
            let status: EventStatus = status.parse().map_err(|e: String| anyhow!(e))?;
            let event = app.set_event_status(&event_id, status).await?;
            print_event(&event);
        }
        EventCommands::Delete { event_id } => {
            app.delete_event(&event_id).await?;
            println!("Deleted {}", event_id);
        }
    }
    Ok(())
}

// ===== Check-in =====

async fn scan(
    app: &mut CheckinApp,
    event_id: &str,
    ids: Vec<String>,
    group: Option<&str>,
    allow_conflicts: bool,
) -> Result<()> {
    app.load_from_cache();
    // Take store counters before resending, so unsent check-ins are counted once.
    if let Err(e) = app.refresh_events().await {
        warn!(error = %e, "Event refresh failed, scanning against cached events");
    }
    let replayed = app.flush_pending()?;
    if replayed > 0 {
        println!("Resending {} unsaved check-ins", replayed);
    }

    let options = CheckInOptions { allow_conflicts };
    let mut accepted = 0;
    let mut rejected = 0;

    let mut handle = |app: &mut CheckinApp, outcome: Result<AttendanceEntry, CheckInError>| match outcome {
        Ok(entry) => {
            accepted += 1;
            let count = app
                .events()
                .get(event_id)
                .map(|e| e.count_summary())
                .unwrap_or_default();
            println!("OK    {}  {}  [{}]", entry.person.masked_id_number(), entry.person.full_name(), count);
        }
        Err(e) => {
            rejected += 1;
            println!("FAIL  {}", e);
        }
    };

    if ids.is_empty() {
        eprintln!("Reading id numbers from stdin, one per line");
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line.context("Failed to read stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            let outcome = app.check_in(event_id, &line, group, options).await;
            handle(app, outcome);
            app.process_sync_messages();
        }
    } else {
        for id in &ids {
            let outcome = app.check_in(event_id, id, group, options).await;
            handle(app, outcome);
            app.process_sync_messages();
        }
    }

    app.settle(Duration::from_millis(SETTLE_QUIET_MS)).await;
    if let Some(message) = app.status_message.take() {
        eprintln!("{}", message);
    }
    info!(accepted, rejected, "Scan finished");
    println!("{} checked in, {} rejected", accepted, rejected);
    Ok(())
}

async fn remove(app: &mut CheckinApp, event_id: &str, id_number: &str) -> Result<()> {
    app.watch_event(event_id).await?;
    let entry_id = app
        .find_entry(event_id, id_number.trim())
        .map(|e| e.id.clone())
        .ok_or_else(|| anyhow!("{} is not checked in to {}", id_number, event_id))?;
    let entry = app.remove_entry(event_id, &entry_id).await?;
    app.settle(Duration::from_millis(SETTLE_QUIET_MS)).await;
    if let Some(message) = app.status_message.take() {
        bail!(message);
    }
    println!("Removed {}", entry.person.full_name());
    Ok(())
}

async fn entries(app: &mut CheckinApp, event_id: &str) -> Result<()> {
    let count = app.load_entries(event_id).await?;
    for entry in app.entries(event_id) {
        println!(
            "{}  {}  {:<30}  {:<12}  {}",
            entry.formatted_time(),
            entry.person.masked_id_number(),
            truncate_string(&entry.person.display_name(), 30),
            entry.group.as_deref().unwrap_or("-"),
            entry.recorded_by
        );
    }
    println!("{} entries", count);
    Ok(())
}

// ===== Reports =====

async fn conflicts(app: &mut CheckinApp) -> Result<()> {
    let reports = app.conflict_report().await?;
    if reports.is_empty() {
        println!("No conflicts");
        return Ok(());
    }
    for report in &reports {
        println!(
            "{}  {:<28}  {} ({})  <->  {} ({})",
            checkin_core::models::mask_id_number(&report.id_number),
            truncate_string(&report.person_name, 28),
            report.first.event_name,
            report.first.recorded_by,
            report.second.event_name,
            report.second.recorded_by
        );
    }
    println!("{} conflicts", reports.len());
    Ok(())
}

async fn stats(app: &mut CheckinApp, event_id: &str) -> Result<()> {
    let stats = app.event_stats(event_id).await?;
    println!("{}", stats.event_name);
    println!(
        "  counter {}  entries {}  target {}  fill {}",
        stats.counter,
        stats.actual,
        if stats.target_count == 0 { "-".to_string() } else { stats.target_count.to_string() },
        format_percent(stats.fill_percent)
    );
    if let Some(remaining) = stats.remaining {
        println!("  remaining {}", remaining);
    }
    for group in &stats.groups {
        println!(
            "  {:<20} counter {:>5}  entries {:>5}  target {:>5}",
            group.name, group.counter, group.actual, group.target_count
        );
    }
    for (recorder, count) in &stats.by_recorder {
        println!("  {:<20} {:>5}", recorder, count);
    }
    if stats.has_drift() {
        println!("  counters drift by {} - run `checkin recount {}`", stats.drift, event_id);
    }
    Ok(())
}

async fn recount(app: &mut CheckinApp, event_id: &str) -> Result<()> {
    let snapshot = app.reconcile_counts(event_id).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn watch(app: &mut CheckinApp, event_id: &str) -> Result<()> {
    app.watch_event(event_id).await?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut first = true;
    eprintln!("Watching {} - press Ctrl-C to stop", event_id);

    loop {
        let mut new_entries = Vec::new();
        for entry in app.entries(event_id) {
            if seen.insert(entry.id.clone()) && !first {
                new_entries.push(format!(
                    "+ {}  {}  by {}",
                    entry.formatted_time(),
                    entry.person.full_name(),
                    entry.recorded_by
                ));
            }
        }
        let visible: HashSet<String> = app.entries(event_id).iter().map(|e| e.id.clone()).collect();
        let gone = seen.len() - seen.intersection(&visible).count();
        seen.retain(|id| visible.contains(id));

        for line in &new_entries {
            println!("{}", line);
        }
        if gone > 0 {
            println!("- {} removed", gone);
        }
        if first || !new_entries.is_empty() || gone > 0 {
            if let Some(event) = app.events().get(event_id) {
                println!("  {} [{}]", event.name, event.count_summary());
            }
        }
        first = false;

        app.next_message(Duration::from_secs(WATCH_TICK_SECS)).await;
        app.process_sync_messages();
    }
}

// ===== Users =====

async fn user_command(app: &mut CheckinApp, command: UserCommands) -> Result<()> {
    match command {
        UserCommands::Add { username, roles } => {
            let roles = roles
                .iter()
                .map(|r| r.parse::<Role>().map_err(|e| anyhow!(e)))
                .collect::<Result<Vec<_>>>()?;
            let password = rpassword::prompt_password(format!("New password for {}: ", username))?;
            let user = app.add_user(&username, &password, roles).await?;
            println!("Added {}", user.username);
        }
        UserCommands::Passwd { username } => {
            let password = rpassword::prompt_password(format!("New password for {}: ", username))?;
            let confirm = rpassword::prompt_password("Repeat: ")?;
            if password != confirm {
                bail!("Passwords do not match");
            }
            app.set_password(&username, &password).await?;
            println!("Password updated");
        }
    }
    Ok(())
}
