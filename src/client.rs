//! HTTP client behind the CLI subcommands. Thin calls against the
//! daemon's control API with human-readable output.

use anyhow::{bail, Context, Result};
use reqwest::{Method, Response};
use serde_json::{json, Value};

async fn request(method: Method, url: &str, body: Option<Value>) -> Result<Response> {
    let client = reqwest::Client::new();
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    request
        .send()
        .await
        .with_context(|| format!("cannot reach daemon at {url}"))
}

async fn expect_ok(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        bail!("{message}");
    }
    Ok(body)
}

pub async fn status(url: &str) -> Result<()> {
    let response = request(Method::GET, &format!("{url}/api/status"), None).await?;
    let status = expect_ok(response).await?;

    let phase = status["phase"].as_str().unwrap_or("unknown");
    println!("Phase:     {phase}");
    match status["battery_percent"].as_u64() {
        Some(percent) => println!("Battery:   {percent}%"),
        None => println!("Battery:   --"),
    }
    let charging = status["is_charging"].as_bool().unwrap_or(false);
    println!("Charging:  {}", if charging { "yes" } else { "no" });
    if let Some(max) = status["charge_max"].as_u64() {
        let min_str = status["charge_min"]
            .as_u64()
            .map(|min| format!(" (min: {min}%)"))
            .unwrap_or_default();
        println!("Max:       {max}%{min_str}");
    }

    if let Some(device) = status.get("device").filter(|d| !d.is_null()) {
        let name = device["name"].as_str().unwrap_or("unknown");
        let fw = device["firmware"].as_str().unwrap_or("?");
        let hw = device["hardware"].as_str().unwrap_or("?");
        println!("Device:    {name} (FW: {fw}, HW: {hw})");
    }

    if let Some(telemetry) = status.get("telemetry").filter(|t| !t.is_null()) {
        let volts = telemetry["volts"].as_f64().unwrap_or(0.0);
        let amps = telemetry["amps"].as_f64().unwrap_or(0.0);
        let watts = telemetry["watts"].as_f64().unwrap_or(0.0);
        println!("Telemetry: {volts:.2}V  {amps:.2}A  {watts:.2}W");
    }

    if phase == "reconnecting" {
        let attempt = status["reconnect_attempt"].as_u64().unwrap_or(0);
        let delay = status["reconnect_delay"].as_u64().unwrap_or(0);
        println!("Reconnect: attempt {attempt} (next in {delay}s)");
    }

    Ok(())
}

pub async fn set_max(url: &str, value: u8) -> Result<()> {
    let response = request(
        Method::PUT,
        &format!("{url}/api/settings"),
        Some(json!({"charge_max": value})),
    )
    .await?;
    expect_ok(response).await?;
    println!("Charge max set to {value}%");
    Ok(())
}

pub async fn set_min(url: &str, value: u8) -> Result<()> {
    let response = request(
        Method::PUT,
        &format!("{url}/api/settings"),
        Some(json!({"charge_min": value})),
    )
    .await?;
    expect_ok(response).await?;
    println!("Charge min set to {value}%");
    Ok(())
}

pub async fn scan(url: &str) -> Result<()> {
    let response = request(Method::POST, &format!("{url}/api/scan"), None).await?;
    let body = expect_ok(response).await?;
    println!(
        "{}",
        body.get("message").and_then(Value::as_str).unwrap_or("Scan started")
    );
    Ok(())
}

pub async fn disconnect(url: &str) -> Result<()> {
    let response = request(Method::POST, &format!("{url}/api/disconnect"), None).await?;
    expect_ok(response).await?;
    println!("Disconnected");
    Ok(())
}

pub async fn stop(url: &str) -> Result<()> {
    let response = request(Method::POST, &format!("{url}/api/shutdown"), None).await?;
    expect_ok(response).await?;
    println!("Daemon stopped");
    Ok(())
}
