//! Plugin-side SDK.
//!
//! A plugin is an executable that reads framed requests on stdin and writes
//! framed responses on stdout. Implement [`Plugin`] and hand it to [`serve`]:
//!
//! ```no_run
//! use dataq_plugin::{serve, Emitter, Plugin};
//! use dataq_protocol::{Action, Config, DataItem};
//!
//! struct Hello;
//!
//! impl Plugin for Hello {
//!     fn id(&self) -> &str {
//!         "hello"
//!     }
//!
//!     fn extract(&mut self, _action: &Action, _config: &Config, out: &mut Emitter<'_>) -> anyhow::Result<()> {
//!         out.item(DataItem::new("", "greeting", "text", "text/plain", b"hi".to_vec()))
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     serve(Hello)?;
//!     Ok(())
//! }
//! ```
//!
//! stdout belongs to the protocol. Anything a plugin prints to stderr is
//! reported to the worker as an error, so use it only for real problems.

use anyhow::{anyhow, bail};
use dataq_protocol::{
    decode_message, encode_message, write_frame, Action, Config, DataItem, FrameIter, Operation,
    PluginRequest, PluginResponse, ProtocolError,
};
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Extraction logic for one data source.
pub trait Plugin {
    /// Plugin id used when a request does not name one.
    fn id(&self) -> &str;

    /// Receive the static configuration. Called once per session, before any work.
    fn configure(&mut self, _config: &Config) -> anyhow::Result<()> {
        Ok(())
    }

    /// Perform `action`, emitting items and follow-up actions as they are found.
    fn extract(
        &mut self,
        action: &Action,
        config: &Config,
        out: &mut Emitter<'_>,
    ) -> anyhow::Result<()>;

    /// Derive new items from stored content.
    fn transform(
        &mut self,
        item: &DataItem,
        _config: &Config,
        _out: &mut Emitter<'_>,
    ) -> anyhow::Result<()> {
        bail!("plugin {} does not support transforming {} items", self.id(), item.kind)
    }
}

/// Streams responses for the request being handled.
pub struct Emitter<'a> {
    plugin_id: &'a str,
    request_id: &'a str,
    parent_hash: Option<&'a str>,
    writer: &'a mut dyn Write,
}

impl<'a> Emitter<'a> {
    /// Send an item. Fills in the plugin id, timestamp, parent hash and
    /// content hash when they are unset.
    pub fn item(&mut self, mut item: DataItem) -> anyhow::Result<()> {
        if item.plugin_id.is_empty() {
            item.plugin_id = self.plugin_id.to_string();
        }
        if item.timestamp == 0 {
            item.timestamp = unix_now();
        }
        if item.parent_hash.is_none() {
            item.parent_hash = self.parent_hash.map(str::to_string);
        }
        item.seal();
        self.send(PluginResponse::item(self.plugin_id, self.request_id, item))
    }

    /// Queue follow-up work.
    pub fn action(&mut self, mut action: Action) -> anyhow::Result<()> {
        if action.parent_hash.is_none() {
            action.parent_hash = self.parent_hash.map(str::to_string);
        }
        self.send(PluginResponse::action(self.plugin_id, self.request_id, action))
    }

    fn send(&mut self, response: PluginResponse) -> anyhow::Result<()> {
        write_response(self.writer, &response)?;
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn write_response(mut writer: &mut dyn Write, response: &PluginResponse) -> Result<(), ProtocolError> {
    let body = encode_message(response)?;
    write_frame(&mut writer, &body)?;
    Ok(())
}

/// Serve requests on stdin/stdout until stdin closes.
pub fn serve<P: Plugin>(plugin: P) -> Result<(), ProtocolError> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_io(plugin, stdin.lock(), stdout.lock())
}

/// Serve requests from `reader`, writing responses to `writer`.
///
/// Every request is answered with its items/actions, an error if the plugin
/// failed, and then `done`. At end of input a final `closed` is written. A
/// truncated request stream is returned as an error after `closed`.
pub fn serve_io<P, R, W>(mut plugin: P, reader: R, mut writer: W) -> Result<(), ProtocolError>
where
    P: Plugin,
    R: Read,
    W: Write,
{
    let mut frames = FrameIter::new(reader);

    for frame in frames.by_ref() {
        let request: PluginRequest = match decode_message(&frame) {
            Ok(request) => request,
            Err(e) => {
                let response =
                    PluginResponse::error(plugin.id(), "", format!("undecodable request: {}", e));
                write_response(&mut writer, &response)?;
                continue;
            }
        };

        let plugin_id = if request.plugin_id.is_empty() {
            plugin.id().to_string()
        } else {
            request.plugin_id.clone()
        };

        if let Err(e) = handle(&mut plugin, &request, &plugin_id, &mut writer) {
            // A broken stdout surfaces again on this write and ends the loop
            let response = PluginResponse::error(&plugin_id, &request.id, format!("{:#}", e));
            write_response(&mut writer, &response)?;
        }
        write_response(&mut writer, &PluginResponse::done(&plugin_id, &request.id))?;
    }

    let truncated = frames.take_error();
    write_response(&mut writer, &PluginResponse::closed(plugin.id()))?;
    match truncated {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn handle<P: Plugin>(
    plugin: &mut P,
    request: &PluginRequest,
    plugin_id: &str,
    writer: &mut dyn Write,
) -> anyhow::Result<()> {
    match request.operation {
        Operation::Configure => plugin.configure(&request.config),
        Operation::Extract => {
            let action = request
                .action
                .as_ref()
                .ok_or_else(|| anyhow!("extract request {} has no action", request.id))?;
            let mut out = Emitter {
                plugin_id,
                request_id: &request.id,
                parent_hash: action.parent_hash.as_deref(),
                writer,
            };
            plugin.extract(action, &request.config, &mut out)
        }
        Operation::Transform => {
            let item = request
                .item
                .as_ref()
                .ok_or_else(|| anyhow!("transform request {} has no item", request.id))?;
            item.verify()?;
            let mut out = Emitter {
                plugin_id,
                request_id: &request.id,
                parent_hash: Some(&item.hash),
                writer,
            };
            plugin.transform(item, &request.config, &mut out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataq_protocol::{read_frame, ResponsePayload};
    use std::io::Cursor;

    struct Echo;

    impl Plugin for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn configure(&mut self, config: &Config) -> anyhow::Result<()> {
            if config.contains_key("broken") {
                bail!("bad configuration");
            }
            Ok(())
        }

        fn extract(
            &mut self,
            action: &Action,
            _config: &Config,
            out: &mut Emitter<'_>,
        ) -> anyhow::Result<()> {
            if action.name == "fail" {
                bail!("asked to fail");
            }
            out.item(DataItem::new("", &action.name, "text", "text/plain", b"body".to_vec()))?;
            out.action(Action::new("next"))
        }
    }

    fn frames(requests: &[PluginRequest]) -> Vec<u8> {
        let mut buf = Vec::new();
        for request in requests {
            write_frame(&mut buf, &encode_message(request).unwrap()).unwrap();
        }
        buf
    }

    fn responses(output: Vec<u8>) -> Vec<PluginResponse> {
        let mut cursor = Cursor::new(output);
        let mut out = Vec::new();
        while let Some(frame) = read_frame(&mut cursor).unwrap() {
            out.push(decode_message(&frame).unwrap());
        }
        out
    }

    #[test]
    fn test_request_lifecycle() {
        let mut config = Config::new();
        config.insert("k".into(), "v".into());
        let input = frames(&[
            PluginRequest::configure("c1", "echo-1", config),
            PluginRequest::extract("r1", "echo-1", Action::new("scan")),
        ]);

        let mut output = Vec::new();
        serve_io(Echo, Cursor::new(input), &mut output).unwrap();
        let out = responses(output);

        assert_eq!(out.len(), 5, "{:?}", out);
        assert_eq!(out[0], PluginResponse::done("echo-1", "c1"));
        match &out[1].payload {
            ResponsePayload::Item { item } => {
                assert_eq!(item.plugin_id, "echo-1");
                assert!(item.verify().is_ok());
                assert!(item.timestamp > 0);
            }
            other => panic!("expected item, got {:?}", other),
        }
        assert!(matches!(out[2].payload, ResponsePayload::Action { .. }));
        assert_eq!(out[3], PluginResponse::done("echo-1", "r1"));
        assert!(out[4].is_closed());
    }

    #[test]
    fn test_plugin_error_is_followed_by_done() {
        let input = frames(&[PluginRequest::extract("r1", "echo", Action::new("fail"))]);
        let mut output = Vec::new();
        serve_io(Echo, Cursor::new(input), &mut output).unwrap();
        let out = responses(output);

        assert_eq!(
            out[0],
            PluginResponse::error("echo", "r1", "asked to fail")
        );
        assert_eq!(out[1], PluginResponse::done("echo", "r1"));
        assert!(out[2].is_closed());
    }

    #[test]
    fn test_configure_failure_reported() {
        let mut config = Config::new();
        config.insert("broken".into(), "yes".into());
        let input = frames(&[PluginRequest::configure("c1", "echo", config)]);
        let mut output = Vec::new();
        serve_io(Echo, Cursor::new(input), &mut output).unwrap();
        let out = responses(output);

        assert_eq!(out[0], PluginResponse::error("echo", "c1", "bad configuration"));
        assert_eq!(out[1], PluginResponse::done("echo", "c1"));
    }

    #[test]
    fn test_transform_unsupported_by_default() {
        let mut item = DataItem::new("echo", "src", "text", "text/plain", b"x".to_vec());
        item.seal();
        let input = frames(&[PluginRequest::transform("r1", "echo", item)]);
        let mut output = Vec::new();
        serve_io(Echo, Cursor::new(input), &mut output).unwrap();
        let out = responses(output);

        match &out[0].payload {
            ResponsePayload::Error { message } => assert!(message.contains("does not support")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(out[1], PluginResponse::done("echo", "r1"));
    }

    #[test]
    fn test_truncated_input_reported_after_closed() {
        let mut input = frames(&[PluginRequest::configure("c1", "echo", Config::new())]);
        input.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 50, 1, 2]);
        let mut output = Vec::new();
        let result = serve_io(Echo, Cursor::new(input), &mut output);

        assert!(matches!(result, Err(ProtocolError::Framing(_))));
        let out = responses(output);
        assert!(out.last().unwrap().is_closed());
    }

    #[test]
    fn test_undecodable_request_reported() {
        let mut input = Vec::new();
        write_frame(&mut input, b"not json").unwrap();
        let mut output = Vec::new();
        serve_io(Echo, Cursor::new(input), &mut output).unwrap();
        let out = responses(output);
        assert!(matches!(out[0].payload, ResponsePayload::Error { .. }));
        assert!(out[1].is_closed());
    }
}
