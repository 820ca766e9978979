//! Commands addressed to a structured scope.
//!
//! With no addressing entries a scope is just the command's `scope`
//! attribute. With entries, the command also carries a `<scope>` element
//! holding one `<key name="value"/>` child per entry, e.g.
//!
//! ```text
//! <command name="get-value" scope="Canvas" sequence-id="9">
//!     <scope><project name="demo"/><canvas name="main"/></scope>
//! </command>
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::error;

use crate::command::{Command, PARAM_NAME, PARAM_VALUE};
use crate::error::LinkError;
use crate::message::Message;
use crate::processor::CommandProcessor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandScope {
    name: String,
    entries: Vec<(String, String)>,
}

impl CommandScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, name: impl Into<String>) -> Self {
        self.entries.push((key.into(), name.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build a command addressed to this scope.
    pub fn command<S>(&self, processor: &mut CommandProcessor<S>, cmd_name: &str) -> Command
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut cmd = processor.command_in(cmd_name, &self.name);
        if !self.entries.is_empty() {
            let scope = cmd.scope_element(&self.name);
            for (key, name) in &self.entries {
                scope.push_child(Message::new(key.as_str())).set_attr("name", name.as_str());
            }
        }
        cmd
    }

    /// `set-<name>` with a `<name value=".."/>` payload.
    pub async fn set_value<S>(
        &self,
        processor: &mut CommandProcessor<S>,
        name: &str,
        value: impl Display,
    ) -> Result<Message, LinkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut cmd = self.command(processor, &format!("set-{name}"));
        cmd.tag(name).set_attr("value", value.to_string());
        let text = cmd.to_string();
        let resp = processor.execute(cmd).await?;
        if !resp.is_success() {
            error!("command failed: {text}");
        }
        Ok(resp)
    }

    /// `get-<name>`; the value of the response's `<name value=".."/>`, if
    /// the command succeeded.
    pub async fn get_value<S>(
        &self,
        processor: &mut CommandProcessor<S>,
        name: &str,
    ) -> Result<Option<String>, LinkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cmd = self.command(processor, &format!("get-{name}"));
        let resp = processor.execute(cmd).await?;
        if !resp.is_success() {
            return Ok(None);
        }
        Ok(resp
            .find(name)
            .and_then(|tag| tag.attr("value"))
            .map(str::to_owned))
    }

    /// `set-parameters`, optionally naming the target.
    pub async fn set_parameters<S, I, K, V>(
        &self,
        processor: &mut CommandProcessor<S>,
        target: Option<&str>,
        parameters: I,
    ) -> Result<Message, LinkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Display,
    {
        let mut cmd = self.command(processor, "set-parameters");
        if let Some(target) = target {
            cmd.tag("name").set_attr("value", target);
        }
        for (key, value) in parameters {
            cmd.param(key.as_ref(), value.to_string());
        }
        processor.execute(cmd).await
    }

    /// `list-parameters`, collected from the response's
    /// `paramlist/param` entries.
    pub async fn list_parameters<S>(
        &self,
        processor: &mut CommandProcessor<S>,
        target: Option<&str>,
    ) -> Result<BTreeMap<String, String>, LinkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut cmd = self.command(processor, "list-parameters");
        if let Some(target) = target {
            cmd.tag("name").set_attr("value", target);
        }
        let resp = processor.execute(cmd).await?;
        Ok(resp
            .find_all("paramlist/param")
            .filter_map(|p| Some((p.attr(PARAM_NAME)?.to_owned(), p.attr(PARAM_VALUE)?.to_owned())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
    use tokio::task::JoinHandle;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::codec::XmlCodec;
    use crate::config::SessionConfig;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            read_timeout_ms: 10,
            heartbeat_after: 0,
            ..Default::default()
        }
    }

    /// A processor plus a peer task that answers one command with
    /// `reply`, where `{id}` is replaced by the command's id. The task
    /// hands back the command it saw.
    fn answered_once(reply: &'static str) -> (CommandProcessor<DuplexStream>, JoinHandle<Message>) {
        let (ours, theirs) = duplex(4096);
        let processor = CommandProcessor::from_io(ours, &fast_config()).unwrap();
        let peer = tokio::spawn(async move {
            let (rd, mut wr) = tokio::io::split(theirs);
            let mut commands = FramedRead::new(rd, XmlCodec::new());
            let cmd = commands.next().await.unwrap().unwrap();
            let id = cmd.correlation_id().unwrap();
            wr.write_all(reply.replace("{id}", id).as_bytes()).await.unwrap();
            cmd
        });
        (processor, peer)
    }

    fn params(cmd: &Message) -> Vec<(&str, &str)> {
        cmd.find_all("param")
            .map(|p| (p.attr(PARAM_NAME).unwrap(), p.attr(PARAM_VALUE).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn plain_scope_is_an_attribute() {
        let (ours, _peer) = duplex(64);
        let mut processor = CommandProcessor::from_io(ours, &SessionConfig::default()).unwrap();
        let cmd = CommandScope::new("PSCAD").command(&mut processor, "get-version");
        assert_eq!(cmd.scope(), Some("PSCAD"));
        assert!(cmd.message().children().is_empty());
    }

    #[tokio::test]
    async fn entries_become_scope_children() {
        let (ours, _peer) = duplex(64);
        let mut processor = CommandProcessor::from_io(ours, &SessionConfig::default()).unwrap();
        let scope = CommandScope::new("Canvas")
            .with_entry("project", "demo")
            .with_entry("canvas", "main");
        let cmd = scope.command(&mut processor, "list-components");

        assert_eq!(cmd.id(), "1");
        assert_eq!(cmd.scope(), Some("Canvas"));
        let children: Vec<_> = cmd
            .message()
            .child("scope")
            .unwrap()
            .children()
            .iter()
            .map(|c| (c.tag(), c.attr("name").unwrap()))
            .collect();
        assert_eq!(children, [("project", "demo"), ("canvas", "main")]);
    }

    #[tokio::test]
    async fn set_value_writes_named_tag() {
        let (mut processor, peer) = answered_once("<response sequence-id='{id}' success='true'/>");
        let resp = CommandScope::new("Project")
            .set_value(&mut processor, "run", true)
            .await
            .unwrap();
        let cmd = peer.await.unwrap();

        assert!(resp.is_success());
        assert_eq!(cmd.attr("name"), Some("set-run"));
        assert_eq!(cmd.attr("scope"), Some("Project"));
        assert_eq!(cmd.find("run").and_then(|t| t.attr("value")), Some("true"));
    }

    #[tokio::test]
    async fn get_value_reads_named_tag() {
        let (mut processor, peer) = answered_once(
            "<response sequence-id='{id}' success='true'><version value='5.0.2'/></response>",
        );
        let value = CommandScope::new("PSCAD")
            .get_value(&mut processor, "version")
            .await
            .unwrap();
        let cmd = peer.await.unwrap();

        assert_eq!(cmd.attr("name"), Some("get-version"));
        assert_eq!(value.as_deref(), Some("5.0.2"));
    }

    #[tokio::test]
    async fn get_value_is_none_when_the_command_failed() {
        let (mut processor, peer) = answered_once(
            "<response sequence-id='{id}' success='false'><version value='stale'/></response>",
        );
        let value = CommandScope::new("PSCAD")
            .get_value(&mut processor, "version")
            .await
            .unwrap();
        peer.await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn set_parameters_names_target_and_lists_params() {
        let (mut processor, peer) = answered_once("<response sequence-id='{id}' success='true'/>");
        let scope = CommandScope::new("Canvas").with_entry("project", "demo");
        scope
            .set_parameters(
                &mut processor,
                Some("main"),
                [("enabled", false), ("visible", true)],
            )
            .await
            .unwrap();
        let cmd = peer.await.unwrap();

        assert_eq!(cmd.attr("name"), Some("set-parameters"));
        assert_eq!(cmd.find("name").and_then(|t| t.attr("value")), Some("main"));
        assert_eq!(cmd.find("scope/project").and_then(|t| t.attr("name")), Some("demo"));
        assert_eq!(params(&cmd), [("enabled", "false"), ("visible", "true")]);
    }

    #[tokio::test]
    async fn set_parameters_without_target_has_no_name_tag() {
        let (mut processor, peer) = answered_once("<response sequence-id='{id}' success='true'/>");
        CommandScope::new("Project")
            .set_parameters(&mut processor, None, [("steps", 10)])
            .await
            .unwrap();
        let cmd = peer.await.unwrap();

        assert!(cmd.find("name").is_none());
        assert_eq!(params(&cmd), [("steps", "10")]);
    }

    #[tokio::test]
    async fn list_parameters_collects_paramlist() {
        let (mut processor, peer) = answered_once(concat!(
            "<response sequence-id='{id}' success='true'><paramlist>",
            "<param name='b' value='2'/><param name='a' value='1'/><param name='odd'/>",
            "</paramlist></response>",
        ));
        let listed = CommandScope::new("Component")
            .list_parameters(&mut processor, Some("R1"))
            .await
            .unwrap();
        let cmd = peer.await.unwrap();

        assert_eq!(cmd.attr("name"), Some("list-parameters"));
        assert_eq!(cmd.find("name").and_then(|t| t.attr("value")), Some("R1"));
        let expected: BTreeMap<String, String> =
            [("a", "1"), ("b", "2")].map(|(k, v)| (k.to_owned(), v.to_owned())).into();
        assert_eq!(listed, expected);
    }
}
