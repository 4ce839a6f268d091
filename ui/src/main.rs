//! `dossier-ctl`: administrative client for a membership node.
//!
//! The target node comes from `--node` or `NODE_URL`, the shared secret from
//! `--key` or `DOSSIER_KEY`.

use serde::Deserialize;
use serde_json::{Value, json};

const ENDPOINT_RPC: &str = "/RPC2";
const USAGE: &str = "\
Usage: dossier-ctl [--node <url>] [--key <key>] <command>

Commands:
  ping
  get <self|nodes> [full|partial|field,field,...] [id]
  add <host> <port> [kind] [route]
  update <self|nodes> <id> <json-fields>
  disable <id>
  delete <nodes> <id>";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Ping,
    Get {
        group: String,
        format: Value,
        id: Option<String>,
    },
    Add {
        host: String,
        port: u16,
        kind: Option<String>,
        route: Option<String>,
    },
    Update {
        group: String,
        id: String,
        fields: Value,
    },
    Delete {
        group: String,
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Invocation {
    node_url: String,
    key: String,
    command: Command,
}

#[derive(Debug, Deserialize)]
struct Answer {
    retcode: u8,
    desc: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    answer: Vec<Answer>,
    #[serde(default)]
    data: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    let default_node =
        std::env::var("NODE_URL").unwrap_or_else(|_| "http://127.0.0.1:5555".to_string());
    let default_key = std::env::var("DOSSIER_KEY").unwrap_or_else(|_| "1".to_string());

    let invocation = match parse_args(std::env::args().skip(1), default_node, default_key) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let (method, params) = request_for(&invocation);
    let url = format!("{}{}", invocation.node_url, ENDPOINT_RPC);
    tracing::debug!("POST {} method={}", url, method);

    let envelope: Envelope = reqwest::Client::new()
        .post(url)
        .json(&json!({ "method": method, "params": params }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!("{}", serde_json::to_string_pretty(&envelope.data)?);

    match envelope.answer.first() {
        Some(answer) if answer.retcode == 0 => Ok(()),
        Some(answer) => {
            eprintln!("retcode {}: {}", answer.retcode, answer.desc);
            std::process::exit(i32::from(answer.retcode));
        }
        None => anyhow::bail!("reply carried no answer block"),
    }
}

fn parse_args<I>(args: I, default_node: String, default_key: String) -> anyhow::Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut node_url = default_node;
    let mut key = default_key;
    let mut rest = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--node" => node_url = args.next().ok_or_else(|| anyhow::anyhow!("--node needs a value"))?,
            "--key" => key = args.next().ok_or_else(|| anyhow::anyhow!("--key needs a value"))?,
            _ => rest.push(arg),
        }
    }

    let command = match rest.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["ping"] => Command::Ping,
        ["get", group] => Command::Get {
            group: group.to_string(),
            format: json!("full"),
            id: None,
        },
        ["get", group, format] => Command::Get {
            group: group.to_string(),
            format: parse_format(format),
            id: None,
        },
        ["get", group, format, id] => Command::Get {
            group: group.to_string(),
            format: parse_format(format),
            id: Some(id.to_string()),
        },
        ["add", host, port, extra @ ..] if extra.len() <= 2 => Command::Add {
            host: host.to_string(),
            port: port.parse()?,
            kind: extra.first().map(|s| s.to_string()),
            route: extra.get(1).map(|s| s.to_string()),
        },
        ["update", group, id, fields] => Command::Update {
            group: group.to_string(),
            id: id.to_string(),
            fields: serde_json::from_str(fields)?,
        },
        ["disable", id] => Command::Update {
            group: "nodes".to_string(),
            id: id.to_string(),
            fields: json!({ "status": "disabled" }),
        },
        ["delete", group, id] => Command::Delete {
            group: group.to_string(),
            id: id.to_string(),
        },
        [] => anyhow::bail!("missing command"),
        other => anyhow::bail!("unrecognized command: {}", other.join(" ")),
    };

    Ok(Invocation {
        node_url: normalize_node_url(&node_url),
        key,
        command,
    })
}

fn parse_format(raw: &str) -> Value {
    match raw {
        "full" | "partial" => json!(raw),
        list => Value::Array(
            list.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(|f| json!(f))
                .collect(),
        ),
    }
}

fn normalize_node_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let normalized = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    normalized.trim_end_matches('/').to_string()
}

fn request_for(invocation: &Invocation) -> (&'static str, Value) {
    let key = invocation.key.as_str();
    match &invocation.command {
        Command::Ping => ("ping", json!({})),
        Command::Get { group, format, id } => {
            let mut params = json!({ "key": key, "group": group, "format": format });
            if let Some(id) = id {
                params["id"] = json!(id);
            }
            ("getDossier", params)
        }
        Command::Add {
            host,
            port,
            kind,
            route,
        } => {
            let mut fields = json!({ "host": host, "port": port });
            if let Some(kind) = kind {
                fields["kind"] = json!(kind);
            }
            if let Some(route) = route {
                fields["route"] = json!(route);
            }
            (
                "addDossier",
                json!({ "key": key, "group": "nodes", "fields": fields }),
            )
        }
        Command::Update { group, id, fields } => (
            "updateDossier",
            json!({ "key": key, "group": group, "id": id, "fields": fields }),
        ),
        Command::Delete { group, id } => (
            "deleteDossier",
            json!({ "key": key, "group": group, "id": id }),
        ),
    }
}
