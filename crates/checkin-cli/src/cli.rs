use clap::{Parser, Subcommand};

/// Event check-in and attendance administration
#[derive(Parser)]
#[command(
    name = "checkin",
    version = env!("CARGO_PKG_VERSION"),
    about = "Scan id numbers into events with quota, duplicate and conflict checks",
    long_about = None
)]
pub struct Cli {
    /// Override the document store URL
    #[arg(global = true, long = "store")]
    pub store: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in and start a staff session
    Login {
        /// Username (defaults to CHECKIN_USERNAME or the last used one)
        username: Option<String>,

        #[arg(long, help = "Remember the password in the OS keychain")]
        remember: bool,
    },

    /// End the current session
    Logout {
        #[arg(long, help = "Also delete cached events and entries")]
        purge: bool,

        #[arg(long, help = "Forget the password stored in the keychain")]
        forget: bool,
    },

    /// Show the logged in user
    Whoami,

    /// List events
    Events {
        #[arg(long, help = "Include passive events")]
        all: bool,

        #[arg(long, help = "Filter by name")]
        search: Option<String>,

        #[arg(long, default_value = "start", help = "Sort by name, start or fill")]
        sort: String,

        #[arg(long)]
        desc: bool,

        #[arg(long, help = "Use the cached list without contacting the store")]
        offline: bool,
    },

    /// Create, close or delete events (admin)
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Check people in to an event. Reads ids from stdin when none are given.
    Scan {
        event_id: String,

        ids: Vec<String>,

        #[arg(long, help = "Sub-group to count the check-ins against")]
        group: Option<String>,

        #[arg(long, help = "Admin only: accept people already in an overlapping event")]
        allow_conflicts: bool,
    },

    /// Remove a person's check-in from an event
    Remove { event_id: String, id_number: String },

    /// List an event's check-ins
    Entries { event_id: String },

    /// Report people checked in to overlapping events
    Conflicts,

    /// Show counters and check-in statistics for an event
    Stats { event_id: String },

    /// Recompute an event's counters from its entries (admin)
    Recount { event_id: String },

    /// Follow an event's check-ins live
    Watch { event_id: String },

    /// Manage staff accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
pub enum EventCommands {
    /// Create an event
    Create {
        name: String,

        #[arg(long, help = "Start time, RFC 3339 or \"YYYY-MM-DD HH:MM\" local time")]
        start: String,

        #[arg(long, help = "End time, same formats as --start")]
        end: String,

        #[arg(long, default_value_t = 0, help = "Maximum attendees, 0 for unlimited")]
        target: u32,

        #[arg(long = "group", help = "Sub-group quota as NAME=COUNT, repeatable")]
        groups: Vec<String>,
    },

    /// Set an event ACTIVE or PASSIVE
    Status { event_id: String, status: String },

    /// Delete an event with no check-ins
    Delete { event_id: String },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Add a staff account (admin)
    Add {
        username: String,

        #[arg(long = "role", default_value = "staff", help = "viewer, staff or admin; repeatable")]
        roles: Vec<String>,
    },

    /// Change a password (your own, or anyone's as admin)
    Passwd { username: String },
}
