//! Minimal ACP agent speaking line-delimited JSON-RPC over stdio, used by
//! the stdio transport integration tests. Supports initialize, session/new,
//! session/load (always "Resource not found"), session/prompt with a couple
//! of streamed updates, and session/cancel.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn main() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut session_counter = 0u32;
    let mut cancelled = false;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
        let id = frame.get("id").cloned();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        match (method, id) {
            ("initialize", Some(id)) => {
                reply(
                    &mut out,
                    &id,
                    json!({
                        "protocolVersion": 1,
                        "agentCapabilities": { "loadSession": true }
                    }),
                );
            }
            ("session/new", Some(id)) => {
                session_counter += 1;
                reply(
                    &mut out,
                    &id,
                    json!({
                        "sessionId": format!("stdio-sess-{session_counter}"),
                        "_meta": { "agentSessionId": format!("inner-{session_counter}") }
                    }),
                );
            }
            ("session/load", Some(id)) => {
                reply_error(&mut out, &id, -32002, "Resource not found");
            }
            ("session/prompt", Some(id)) => {
                cancelled = false;
                let session_id = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                notify(
                    &mut out,
                    "session/update",
                    json!({
                        "sessionId": session_id,
                        "update": {
                            "sessionUpdate": "agent_message_chunk",
                            "content": { "type": "text", "text": "echo: " }
                        }
                    }),
                );
                let text = params
                    .get("prompt")
                    .and_then(|p| p.get(0))
                    .and_then(|b| b.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                notify(
                    &mut out,
                    "session/update",
                    json!({
                        "sessionId": session_id,
                        "update": {
                            "sessionUpdate": "agent_message_chunk",
                            "content": { "type": "text", "text": text }
                        }
                    }),
                );
                let stop = if cancelled { "cancelled" } else { "end_turn" };
                reply(&mut out, &id, json!({ "stopReason": stop }));
            }
            ("session/set_mode", Some(id)) => {
                reply(&mut out, &id, json!({}));
            }
            ("session/set_config_option", Some(id)) => {
                reply(
                    &mut out,
                    &id,
                    json!({ "configId": params.get("configId"), "value": params.get("value") }),
                );
            }
            ("session/cancel", None) => {
                cancelled = true;
            }
            (_, Some(id)) => {
                reply_error(&mut out, &id, -32601, "method not found");
            }
            _ => {}
        }
    }
}

fn reply(out: &mut impl Write, id: &Value, result: Value) {
    let frame = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    let _ = writeln!(out, "{frame}");
    let _ = out.flush();
}

fn reply_error(out: &mut impl Write, id: &Value, code: i64, message: &str) {
    let frame = json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } });
    let _ = writeln!(out, "{frame}");
    let _ = out.flush();
}

fn notify(out: &mut impl Write, method: &str, params: Value) {
    let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
    let _ = writeln!(out, "{frame}");
    let _ = out.flush();
}
