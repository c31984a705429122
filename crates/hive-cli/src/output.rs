use serde_json::Value;

fn s<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}

pub fn print_status(status: &Value) {
    println!("orchestrator : {}", s(status, "orchestrator"));
    println!("uptime       : {}s", status["uptime_s"]);
    println!(
        "drones       : {} online / {} total",
        status["drones"]["online"], status["drones"]["total"]
    );
    let q = &status["queue"];
    println!(
        "queue        : {} needed, {} delegated, {} received, {} blocked, {} failed{}",
        q["needed"],
        q["delegated"],
        q["received"],
        q["blocked"],
        q["failed"],
        if status["queue_paused"].as_bool().unwrap_or(false) {
            " (paused)"
        } else {
            ""
        }
    );
    println!(
        "sessions     : {} active / {} total",
        status["sessions"]["active"], status["sessions"]["total"]
    );
}

pub fn print_nodes(nodes: &[Value]) {
    if nodes.is_empty() {
        println!("no drones");
        return;
    }
    println!(
        "{:<16} {:<14} {:<10} {:<7} {:>5} {:>4} {:<20}",
        "NAME", "IP", "TYPE", "ONLINE", "FAILS", "ESC", "CURRENT TASK"
    );
    for node in nodes {
        println!(
            "{:<16} {:<14} {:<10} {:<7} {:>5} {:>4} {:<20}",
            s(node, "name"),
            s(node, "ip"),
            s(node, "drone_type"),
            if node["online"].as_bool().unwrap_or(false) {
                "yes"
            } else {
                "no"
            },
            node["failures"],
            node["escalation_level"],
            s(node, "current_task"),
        );
    }
}

pub fn print_events(events: &[Value]) {
    if events.is_empty() {
        println!("no events");
        return;
    }
    for event in events {
        let target = match (event["drone"].as_str(), event["package"].as_str()) {
            (Some(drone), Some(package)) => format!(" [{} {}]", drone, package),
            (Some(drone), None) => format!(" [{}]", drone),
            (None, Some(package)) => format!(" [{}]", package),
            (None, None) => String::new(),
        };
        println!("{} {:<18}{} {}", s(event, "ts"), s(event, "kind"), target, s(event, "message"));
    }
}
