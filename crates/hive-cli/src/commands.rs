use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

use crate::output;

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn get_json(remote: &str, path: &str) -> Result<Value> {
    let url = format!("{}{}", remote.trim_end_matches('/'), path);
    let response = client()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?;
    parse_response(response).await
}

async fn post_json(remote: &str, path: &str, admin_key: Option<&str>, body: Value) -> Result<Value> {
    let url = format!("{}{}", remote.trim_end_matches('/'), path);
    let mut request = client().post(&url).json(&body);
    if let Some(key) = admin_key {
        request = request.header("X-Admin-Key", key);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("POST {}", url))?;
    parse_response(response).await
}

async fn parse_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        let hint = body["hint"].as_str().map(|h| format!(" ({})", h)).unwrap_or_default();
        return Err(anyhow!("{}: {}{}", status, message, hint));
    }
    Ok(body)
}

pub async fn status(remote: &str) -> Result<()> {
    let status = get_json(remote, "/api/v1/status").await?;
    output::print_status(&status);
    Ok(())
}

pub async fn nodes(remote: &str, all: bool) -> Result<()> {
    let path = if all {
        "/api/v1/nodes?all=true"
    } else {
        "/api/v1/nodes"
    };
    let nodes = get_json(remote, path).await?;
    output::print_nodes(nodes.as_array().map(Vec::as_slice).unwrap_or(&[]));
    Ok(())
}

pub async fn events(remote: &str, limit: u32, kind: Option<&str>) -> Result<()> {
    let mut path = format!("/api/v1/events?limit={}", limit);
    if let Some(kind) = kind {
        path.push_str(&format!("&type={}", kind));
    }
    let events = get_json(remote, &path).await?;
    output::print_events(events.as_array().map(Vec::as_slice).unwrap_or(&[]));
    Ok(())
}

pub async fn queue(
    remote: &str,
    admin_key: Option<&str>,
    packages: Vec<String>,
    session: Option<String>,
) -> Result<()> {
    if packages.is_empty() {
        return Err(anyhow!("no packages given"));
    }
    let key = admin_key.ok_or_else(|| anyhow!("--admin-key (or HIVE_ADMIN_KEY) is required"))?;
    let body = json!({ "packages": packages, "session_name": session });
    let result = post_json(remote, "/api/v1/queue", Some(key), body).await?;
    println!(
        "session {}: {} submitted, {} skipped",
        result["session_name"].as_str().unwrap_or("?"),
        result["submitted"],
        result["skipped"]
    );
    Ok(())
}

pub async fn control(remote: &str, admin_key: Option<&str>, action: &str) -> Result<()> {
    let key = admin_key.ok_or_else(|| anyhow!("--admin-key (or HIVE_ADMIN_KEY) is required"))?;
    let result = post_json(remote, "/api/v1/control", Some(key), json!({ "action": action })).await?;
    println!("{}: {} affected", action, result["affected"]);
    Ok(())
}
