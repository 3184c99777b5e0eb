//! Scripted plugin for the end-to-end tests.
//!
//! Speaks the protocol directly rather than through the SDK so the tests can
//! exercise responses a well-behaved plugin never sends. Behaviour is picked by
//! the `mode` key of the action config, falling back to the request config:
//!
//! - `graph`: one item plus two follow-up actions in `leaf` mode
//! - `leaf`: nothing
//! - `handoff`: one `leaf` action addressed to the plugin named by `target`
//! - `bad-hash`: an item whose declared hash does not match its bytes
//! - `error`: an error response
//! - `exit`: exit with status 3 without answering
//!
//! Transform requests answer with an upper-cased copy of the input item.

use anyhow::Context;
use dataq_protocol::{
    decode_message, encode_message, write_frame, Action, DataItem, FrameIter, Operation,
    PluginRequest, PluginResponse,
};
use std::io::{self, Write};

fn send(out: &mut impl Write, response: PluginResponse) -> anyhow::Result<()> {
    write_frame(out, &encode_message(&response)?)?;
    Ok(())
}

fn handle(out: &mut impl Write, request: PluginRequest) -> anyhow::Result<()> {
    let plugin = request.plugin_id.clone();
    let id = request.id.clone();

    match request.operation {
        Operation::Configure => {}
        Operation::Extract => {
            let action = request.action.unwrap_or_default();
            let mode = action
                .config
                .get("mode")
                .or_else(|| request.config.get("mode"))
                .map(String::as_str)
                .unwrap_or("graph")
                .to_string();

            match mode.as_str() {
                "graph" => {
                    let mut item = DataItem::new(&plugin, "graph-root", "node", "text/plain", b"root".to_vec());
                    item.seal();
                    let parent = item.hash.clone();
                    send(out, PluginResponse::item(&plugin, &id, item))?;
                    for name in ["leaf-a", "leaf-b"] {
                        let child = Action::new(name)
                            .with_config("mode", "leaf")
                            .with_parent(parent.clone());
                        send(out, PluginResponse::action(&plugin, &id, child))?;
                    }
                }
                "leaf" => {}
                "handoff" => {
                    let target = request
                        .config
                        .get("target")
                        .cloned()
                        .unwrap_or_else(|| "other".to_string());
                    let child = Action::new("handed-off")
                        .with_config("mode", "leaf")
                        .with_plugin(target);
                    send(out, PluginResponse::action(&plugin, &id, child))?;
                }
                "bad-hash" => {
                    let mut item = DataItem::new(&plugin, "forged", "node", "text/plain", b"real bytes".to_vec());
                    item.hash = dataq_protocol::ContentHash::of(b"other bytes").to_string();
                    send(out, PluginResponse::item(&plugin, &id, item))?;
                }
                "error" => {
                    send(out, PluginResponse::error(&plugin, &id, "fixture failure"))?;
                }
                "exit" => std::process::exit(3),
                other => {
                    send(out, PluginResponse::error(&plugin, &id, format!("unknown mode {}", other)))?;
                }
            }
        }
        Operation::Transform => {
            let input = request.item.context("transform without item")?;
            let mut derived = DataItem::new(
                &plugin,
                format!("{}#upper", input.source_id),
                "derived",
                input.content_type.clone(),
                input.raw_data.to_ascii_uppercase(),
            );
            derived.parent_hash = Some(input.hash.clone());
            derived.seal();
            send(out, PluginResponse::item(&plugin, &id, derived))?;
        }
    }
    send(out, PluginResponse::done(&plugin, &id))
}

fn main() -> anyhow::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut plugin_id = String::from("fixture");
    let mut frames = FrameIter::new(stdin.lock());
    for frame in frames.by_ref() {
        let request: PluginRequest = decode_message(&frame)?;
        plugin_id = request.plugin_id.clone();
        handle(&mut out, request)?;
    }
    send(&mut out, PluginResponse::closed(&plugin_id))?;
    if let Some(e) = frames.take_error() {
        return Err(e.into());
    }
    Ok(())
}
