// Metric descriptions and command accounting
// The core crate emits the cluster metrics; this module describes them and
// counts shell commands. No recorder is installed by default.

use metrics::{counter, describe_counter, describe_gauge};

/// Describe every metric the process emits. Call once at startup.
pub fn init_metrics() {
    describe_counter!(
        "synod_elections_total",
        "Total number of coordinator elections that changed the coordinator"
    );
    describe_counter!(
        "synod_dispatch_total",
        "Total number of work items executed, by dispatch policy"
    );
    describe_counter!(
        "synod_dispatch_rejected_total",
        "Total number of work items rejected by the chosen member"
    );
    describe_counter!(
        "synod_replication_failures_total",
        "Total number of replica applications that failed"
    );
    describe_gauge!("synod_members_active", "Number of Active members");
    describe_counter!(
        "synod_commands_total",
        "Total number of shell commands, by command and status"
    );

    tracing::info!("Metrics initialized");
}

/// Record one processed command
pub fn record_command(command: &str, ok: bool) {
    let status = if ok { "ok" } else { "rejected" };
    counter!("synod_commands_total", "command" => command.to_string(), "status" => status).increment(1);
}
