use anyhow::{Context, Result, anyhow};
use console::style;
use reqwest::Client;

use super::ClientFlags;
use crate::core::terminal::{GuideSection, print_error, print_info, print_success};

fn endpoint(api_url: &str, path: &str) -> String {
    format!("{}{}", api_url.trim_end_matches('/'), path)
}

/// Parse `--json`; absent means an empty argument object.
pub(crate) fn tool_arguments(raw: Option<&str>) -> Result<serde_json::Value> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(serde_json::json!({}));
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--json is not valid JSON")?;
    if !value.is_object() {
        return Err(anyhow!("--json must be a JSON object"));
    }
    Ok(value)
}

fn report(body: &serde_json::Value, ok_message: &str) {
    let ok = body
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if ok {
        print_success(ok_message);
    } else {
        let message = body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("request failed");
        print_error(message);
    }
}

pub async fn call_tool(flags: &ClientFlags, tool: &str) -> Result<()> {
    let args = tool_arguments(flags.json.as_deref())?;
    let url = endpoint(&flags.api_url, &format!("/api/tools/{}", tool));
    let resp = Client::new()
        .post(&url)
        .json(&args)
        .send()
        .await
        .with_context(|| format!("agent-core is not reachable at {}", flags.api_url))?;
    let status = resp.status();
    let body = resp.json::<serde_json::Value>().await?;
    if !status.is_success() {
        return Err(anyhow!("request failed with status {}", status));
    }

    report(&body, &format!("{} completed", tool));
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn list_runs(flags: &ClientFlags) -> Result<()> {
    let mut request = Client::new().get(endpoint(&flags.api_url, "/api/runs"));
    if let Some(status) = &flags.status {
        request = request.query(&[("status", status.as_str())]);
    }
    let resp = request
        .send()
        .await
        .with_context(|| format!("agent-core is not reachable at {}", flags.api_url))?;
    let body = resp.json::<serde_json::Value>().await?;
    if !body.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        report(&body, "");
        return Ok(());
    }

    let runs = body
        .get("runs")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if runs.is_empty() {
        print_info("No runs found.");
        return Ok(());
    }

    let mut section = GuideSection::new("Runs");
    for run in &runs {
        section = section.status(
            &run_label(run),
            &format!(
                "{}",
                style(format!(
                    "{}/{}",
                    field(run, "status"),
                    field(run, "phase")
                ))
                .cyan()
            ),
        );
    }
    section.print();
    println!();
    Ok(())
}

fn field<'a>(value: &'a serde_json::Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("-")
}

fn run_label(run: &serde_json::Value) -> String {
    format!("{} ({})", field(run, "id"), field(run, "runner_type"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_json_means_empty_arguments() {
        assert_eq!(tool_arguments(None).unwrap(), serde_json::json!({}));
        assert_eq!(tool_arguments(Some("  ")).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn json_arguments_must_be_an_object() {
        let args = tool_arguments(Some(r#"{"task":"fix the build"}"#)).unwrap();
        assert_eq!(args["task"], "fix the build");
        assert!(tool_arguments(Some("[1,2]")).is_err());
        assert!(tool_arguments(Some("{task")).is_err());
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://127.0.0.1:17890/", "/api/runs"),
            "http://127.0.0.1:17890/api/runs"
        );
    }

    #[test]
    fn run_label_tolerates_missing_fields() {
        let run = serde_json::json!({ "id": "abc" });
        assert_eq!(run_label(&run), "abc (-)");
    }
}
