//! Drive a running orchestrator over its HTTP API.

use crate::output::{print_json, print_table};
use anyhow::{Context, Result};
use clap::Subcommand;
use labflow_core::model::{Action, ProcessGroup};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Subcommand definition
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum CtlSubcommand {
    /// Start dispatching queued work
    Start,
    /// Stop once the in-flight action and every server are done
    Stop,
    /// Drop the rest of the active process group
    Skip,
    /// Emergency-stop every busy server
    Estop,
    /// Release estopped servers
    ClearEstop,
    /// Clear errored actions on every server
    ClearError,
    /// Show loop state and queue sizes
    Status,
    /// List every live action instance
    Active,
    /// List queued process groups
    Groups,
    /// List pending actions of the active group
    Actions,
    /// Queue a process group read from a YAML file
    Queue {
        file: PathBuf,
        /// Put the group at the front of the queue
        #[arg(long)]
        front: bool,
    },
    /// Queue a single action
    Add {
        server: String,
        operation: String,
        /// Action parameter as KEY=VALUE; VALUE is parsed as JSON when it can be
        #[arg(long = "param", short = 'p', value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Put the action at the front of the queue
        #[arg(long)]
        front: bool,
    },
    /// Remove the queued process group at INDEX
    RemoveGroup { index: usize },
    /// Remove the pending action with sequence number SEQUENCE
    RemoveAction { sequence: String },
    /// Drop every queued process group
    ClearGroups,
    /// Drop every pending action
    ClearActions,
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

struct Client {
    base: String,
    agent: ureq::Agent,
}

impl Client {
    fn new(base: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            base: base.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn read(&self, result: Result<ureq::Response, ureq::Error>, path: &str) -> Result<Value> {
        match result {
            Ok(resp) => Ok(resp.into_json()?),
            Err(ureq::Error::Status(code, resp)) => {
                let body: Value = resp.into_json().unwrap_or(Value::Null);
                let message = body["error"].as_str().unwrap_or("no details").to_string();
                anyhow::bail!("{path} failed with {code}: {message}")
            }
            Err(e) => Err(e).with_context(|| format!("cannot reach orchestrator at {}", self.base)),
        }
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.read(self.agent.get(&self.url(path)).call(), path)
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.read(self.agent.post(&self.url(path)).send_json(body), path)
    }

    fn delete(&self, path: &str) -> Result<Value> {
        self.read(self.agent.delete(&self.url(path)).call(), path)
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn run(base_url: &str, subcommand: CtlSubcommand, json: bool) -> Result<()> {
    let client = Client::new(base_url);
    match subcommand {
        CtlSubcommand::Start => show_value(client.post("/api/start", json!({}))?, json),
        CtlSubcommand::Stop => show_value(client.post("/api/stop", json!({}))?, json),
        CtlSubcommand::Skip => show_value(client.post("/api/skip", json!({}))?, json),
        CtlSubcommand::Estop => show_value(client.post("/api/estop", json!({}))?, json),
        CtlSubcommand::ClearEstop => show_value(client.post("/api/clear_estop", json!({}))?, json),
        CtlSubcommand::ClearError => show_value(client.post("/api/clear_error", json!({}))?, json),
        CtlSubcommand::Status => status(&client, json),
        CtlSubcommand::Active => active(&client, json),
        CtlSubcommand::Groups => groups(&client, json),
        CtlSubcommand::Actions => actions(&client, json),
        CtlSubcommand::Queue { file, front } => queue(&client, &file, front, json),
        CtlSubcommand::Add {
            server,
            operation,
            params,
            front,
        } => add(&client, &server, &operation, &params, front, json),
        CtlSubcommand::RemoveGroup { index } => {
            show_value(client.delete(&format!("/api/process_groups/{index}"))?, json)
        }
        CtlSubcommand::RemoveAction { sequence } => {
            show_value(client.delete(&format!("/api/actions/{sequence}"))?, json)
        }
        CtlSubcommand::ClearGroups => show_value(client.delete("/api/process_groups")?, json),
        CtlSubcommand::ClearActions => show_value(client.delete("/api/actions")?, json),
    }
}

/// Print a small response object as `key: value` lines.
fn show_value(value: Value, json: bool) -> Result<()> {
    if json {
        return print_json(&value);
    }
    match value.as_object() {
        Some(map) => {
            for (k, v) in map {
                println!("{k}: {}", plain(v));
            }
        }
        None => println!("{}", plain(&value)),
    }
    Ok(())
}

fn plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

fn status(client: &Client, json: bool) -> Result<()> {
    let s = client.get("/api/status")?;
    if json {
        return print_json(&s);
    }
    println!("orchestrator:   {}", plain(&s["name"]));
    println!("loop:           {} (intent: {})", plain(&s["loop_state"]), plain(&s["intent"]));
    println!("servers:        {}", plain(&s["global_state"]));
    println!("active group:   {}", plain(&s["active_process_group"]["label"]));
    println!("queued groups:  {}", plain(&s["queued_process_groups"]));
    println!("queued actions: {}", plain(&s["queued_actions"]));
    println!("in flight:      {}", plain(&s["in_flight"]));
    println!("results:        {}", plain(&s["results"]));
    Ok(())
}

fn active(client: &Client, json: bool) -> Result<()> {
    let live = client.get("/api/active_actions")?;
    if json {
        return print_json(&live);
    }
    let rows = live
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|i| {
                    vec![
                        plain(&i["server"]),
                        plain(&i["operation"]),
                        plain(&i["id"]),
                        plain(&i["state"]),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    print_table(&["SERVER", "OPERATION", "ID", "STATE"], rows);
    Ok(())
}

fn groups(client: &Client, json: bool) -> Result<()> {
    let groups = client.get("/api/process_groups")?;
    if json {
        return print_json(&groups);
    }
    let rows = groups
        .as_array()
        .map(|items| {
            items
                .iter()
                .enumerate()
                .map(|(i, g)| vec![i.to_string(), plain(&g["label"]), plain(&g["plan"])])
                .collect()
        })
        .unwrap_or_default();
    print_table(&["#", "LABEL", "PLAN"], rows);
    Ok(())
}

fn actions(client: &Client, json: bool) -> Result<()> {
    let actions = client.get("/api/actions")?;
    if json {
        return print_json(&actions);
    }
    let rows = actions
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|a| {
                    vec![
                        plain(&a["sequence"]),
                        plain(&a["server"]),
                        plain(&a["operation"]),
                        plain(&a["start_condition"]["type"]),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    print_table(&["SEQ", "SERVER", "OPERATION", "START"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// Queueing
// ---------------------------------------------------------------------------

fn position(front: bool) -> &'static str {
    if front {
        "front"
    } else {
        "back"
    }
}

fn queue(client: &Client, file: &Path, front: bool, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let group: ProcessGroup = serde_yaml::from_str(&text)
        .with_context(|| format!("{} is not a process group", file.display()))?;
    let body = json!({ "group": group, "position": position(front) });
    show_value(client.post("/api/process_groups", body)?, json)
}

fn add(
    client: &Client,
    server: &str,
    operation: &str,
    params: &[String],
    front: bool,
    json: bool,
) -> Result<()> {
    let mut action = Action::new(server, operation);
    for p in params {
        let (key, value) = parse_param(p)?;
        action = action.with_param(key, value);
    }
    let body = json!({ "action": action, "position": position(front) });
    show_value(client.post("/api/actions", body)?, json)
}

/// `KEY=VALUE` with VALUE read as JSON, falling back to a plain string.
fn parse_param(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("parameter '{raw}' is not KEY=VALUE"))?;
    if key.is_empty() {
        anyhow::bail!("parameter '{raw}' has an empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
