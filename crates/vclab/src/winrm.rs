//! WinRM script execution over WS-Management SOAP/HTTP.
//!
//! Implements the minimal WS-Man shell sequence needed to run a
//! PowerShell script and capture its output: create shell, start
//! command, drain receive, delete shell. SOAP envelopes are built with
//! string templates and responses are parsed with targeted scanning;
//! the protocol surface is small enough that a full XML stack buys
//! nothing here.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, trace};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::types::{ScriptOutput, WinRmTarget};

// ─── Constants ───────────────────────────────────────────────────────

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_WSA: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";

const MAX_ENVELOPE_SIZE: usize = 512_000;
/// Bound on receive round-trips for one command; each round blocks up
/// to the remote operation timeout.
const MAX_RECEIVE_ROUNDS: u32 = 120;

/// Remote-management collaborator.
#[async_trait]
pub trait WinRmTransport: Send + Sync {
    async fn run_script(&self, target: &WinRmTarget, script: &str)
        -> DriverResult<ScriptOutput>;
}

/// WS-Management transport over reqwest.
pub struct WsmanTransport {
    client: reqwest::Client,
    operation_timeout: String,
}

impl WsmanTransport {
    pub fn new(config: &DriverConfig) -> DriverResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DriverError::connection(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            operation_timeout: format!("PT{}S", config.request_timeout_secs),
        })
    }

    fn endpoint(target: &WinRmTarget) -> String {
        let scheme = if target.credentials.https { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}/wsman",
            target.host, target.credentials.port
        )
    }

    fn auth_header(target: &WinRmTarget) -> String {
        let pair = format!(
            "{}:{}",
            target.credentials.username, target.credentials.password
        );
        format!("Basic {}", BASE64.encode(pair))
    }

    fn envelope_header(
        &self,
        endpoint: &str,
        action: &str,
        shell_id: Option<&str>,
    ) -> String {
        let msg_id = Uuid::new_v4();
        let selector_set = match shell_id {
            Some(id) => format!(
                "\n    <wsman:SelectorSet>\n        <wsman:Selector Name=\"ShellId\">{}</wsman:Selector>\n    </wsman:SelectorSet>",
                xml_escape(id)
            ),
            None => String::new(),
        };
        format!(
            r#"<s:Header>
    <wsa:To>{endpoint}</wsa:To>
    <wsman:ResourceURI>{RESOURCE_CMD}</wsman:ResourceURI>
    <wsa:Action>{action}</wsa:Action>
    <wsa:MessageID>uuid:{msg_id}</wsa:MessageID>
    <wsman:MaxEnvelopeSize>{MAX_ENVELOPE_SIZE}</wsman:MaxEnvelopeSize>
    <wsman:OperationTimeout>{timeout}</wsman:OperationTimeout>
    <wsa:ReplyTo>
      <wsa:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</wsa:Address>
    </wsa:ReplyTo>{selector_set}
  </s:Header>"#,
            timeout = self.operation_timeout,
        )
    }

    fn envelope(&self, header: String, body: String) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{NS_SOAP}" xmlns:wsa="{NS_WSA}" xmlns:wsman="{NS_WSMAN}" xmlns:rsp="{NS_SHELL}">
  {header}
  <s:Body>
    {body}
  </s:Body>
</s:Envelope>"#
        )
    }

    /// Send a raw SOAP XML message and return the response body.
    async fn send_raw(&self, target: &WinRmTarget, soap_body: &str) -> DriverResult<String> {
        let endpoint = Self::endpoint(target);
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/soap+xml;charset=UTF-8"),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&Self::auth_header(target))
                .map_err(|e| DriverError::other(format!("invalid auth header: {e}")))?,
        );

        debug!("winrm request to {endpoint} ({} bytes)", soap_body.len());
        trace!("winrm request body:\n{soap_body}");

        let resp = self
            .client
            .post(&endpoint)
            .headers(headers)
            .body(soap_body.to_string())
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        trace!("winrm response: status={status}, {} bytes", body.len());

        if status.as_u16() == 401 {
            return Err(DriverError::auth("WinRM authentication failed"));
        }
        if !status.is_success() {
            let fault = extract_soap_fault(&body).unwrap_or_default();
            return Err(DriverError::api(
                status.as_u16(),
                if fault.is_empty() {
                    format!("WinRM request failed (HTTP {})", status.as_u16())
                } else {
                    fault
                },
            ));
        }
        if body.contains(":Fault") || body.contains("<Fault") {
            let fault =
                extract_soap_fault(&body).unwrap_or_else(|| "Unknown SOAP fault".to_string());
            return Err(DriverError::other(format!("WinRM SOAP fault: {fault}")));
        }
        Ok(body)
    }

    async fn create_shell(&self, target: &WinRmTarget) -> DriverResult<String> {
        let body = r#"<rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>"#
            .to_string();
        let envelope = self.envelope(
            self.envelope_header(&Self::endpoint(target), ACTION_CREATE, None),
            body,
        );
        let response = self.send_raw(target, &envelope).await?;
        extract_first(
            &response,
            &[
                ("<rsp:ShellId>", "</rsp:ShellId>"),
                ("<ShellId>", "</ShellId>"),
            ],
        )
        .or_else(|| extract_selector(&response, "ShellId"))
        .ok_or_else(|| DriverError::parse("no ShellId in WinRM create response"))
    }

    async fn start_command(
        &self,
        target: &WinRmTarget,
        shell_id: &str,
        script: &str,
    ) -> DriverResult<String> {
        let encoded = BASE64.encode(utf16le_bytes(script));
        let body = format!(
            r#"<rsp:CommandLine>
      <rsp:Command>powershell.exe</rsp:Command>
      <rsp:Arguments>-NoProfile -NonInteractive -EncodedCommand {encoded}</rsp:Arguments>
    </rsp:CommandLine>"#
        );
        let envelope = self.envelope(
            self.envelope_header(&Self::endpoint(target), ACTION_COMMAND, Some(shell_id)),
            body,
        );
        let response = self.send_raw(target, &envelope).await?;
        extract_first(
            &response,
            &[
                ("<rsp:CommandId>", "</rsp:CommandId>"),
                ("<CommandId>", "</CommandId>"),
            ],
        )
        .ok_or_else(|| DriverError::parse("no CommandId in WinRM command response"))
    }

    async fn drain_output(
        &self,
        target: &WinRmTarget,
        shell_id: &str,
        command_id: &str,
    ) -> DriverResult<ScriptOutput> {
        let mut std_out = Vec::new();
        let mut std_err = Vec::new();
        for _ in 0..MAX_RECEIVE_ROUNDS {
            let body = format!(
                r#"<rsp:Receive>
      <rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>"#
            );
            let envelope = self.envelope(
                self.envelope_header(&Self::endpoint(target), ACTION_RECEIVE, Some(shell_id)),
                body,
            );
            let response = self.send_raw(target, &envelope).await?;

            for chunk in extract_streams(&response, "stdout") {
                std_out.extend(decode_stream(&chunk)?);
            }
            for chunk in extract_streams(&response, "stderr") {
                std_err.extend(decode_stream(&chunk)?);
            }

            if response.contains("CommandState/Done") {
                let status_code = extract_first(
                    &response,
                    &[
                        ("<rsp:ExitCode>", "</rsp:ExitCode>"),
                        ("<ExitCode>", "</ExitCode>"),
                    ],
                )
                .and_then(|code| code.trim().parse().ok())
                .unwrap_or(0);
                return Ok(ScriptOutput {
                    status_code,
                    std_out: String::from_utf8_lossy(&std_out).into_owned(),
                    std_err: String::from_utf8_lossy(&std_err).into_owned(),
                });
            }
        }
        Err(DriverError::connection(
            "WinRM command did not complete within the receive budget",
        ))
    }

    async fn delete_shell(&self, target: &WinRmTarget, shell_id: &str) {
        let envelope = self.envelope(
            self.envelope_header(&Self::endpoint(target), ACTION_DELETE, Some(shell_id)),
            String::new(),
        );
        // Best-effort: the shell times out server-side anyway.
        let _ = self.send_raw(target, &envelope).await;
    }
}

#[async_trait]
impl WinRmTransport for WsmanTransport {
    async fn run_script(
        &self,
        target: &WinRmTarget,
        script: &str,
    ) -> DriverResult<ScriptOutput> {
        let shell_id = self.create_shell(target).await?;
        let result = async {
            let command_id = self.start_command(target, &shell_id, script).await?;
            self.drain_output(target, &shell_id, &command_id).await
        }
        .await;
        self.delete_shell(target, &shell_id).await;
        result
    }
}

// ─── XML helpers ─────────────────────────────────────────────────────

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// PowerShell's -EncodedCommand takes base64 over UTF-16LE.
fn utf16le_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn decode_stream(chunk: &str) -> DriverResult<Vec<u8>> {
    BASE64
        .decode(chunk.trim())
        .map_err(|e| DriverError::parse(format!("invalid stream payload: {e}")))
}

/// First value bracketed by any of the (open, close) tag pairs.
fn extract_first(xml: &str, patterns: &[(&str, &str)]) -> Option<String> {
    for (open, close) in patterns {
        if let Some(start) = xml.find(open) {
            let after = start + open.len();
            if let Some(end) = xml[after..].find(close) {
                return Some(xml[after..after + end].to_string());
            }
        }
    }
    None
}

/// Value of `<wsman:Selector Name="{name}">...</wsman:Selector>`.
fn extract_selector(xml: &str, name: &str) -> Option<String> {
    let marker = format!("Selector Name=\"{name}\"");
    let at = xml.find(&marker)?;
    let after = at + xml[at..].find('>')? + 1;
    let end = xml[after..].find("</")?;
    Some(xml[after..after + end].to_string())
}

/// Contents of every `<rsp:Stream Name="{name}" ...>` element. Empty
/// self-closing end markers are skipped.
fn extract_streams(xml: &str, name: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let name_attr = format!("Name=\"{name}\"");
    let mut rest = xml;
    while let Some(at) = rest.find("<rsp:Stream").or_else(|| rest.find("<Stream")) {
        let tail = &rest[at..];
        let Some(tag_end) = tail.find('>') else { break };
        let tag = &tail[..tag_end + 1];
        if tag.contains(&name_attr) && !tag.ends_with("/>") {
            let content_start = tag_end + 1;
            if let Some(close) = tail[content_start..].find("</") {
                let chunk = tail[content_start..content_start + close].trim();
                if !chunk.is_empty() {
                    chunks.push(chunk.to_string());
                }
            }
        }
        rest = &tail[tag_end + 1..];
    }
    chunks
}

/// Extract a SOAP fault message from a response.
fn extract_soap_fault(xml: &str) -> Option<String> {
    extract_first(
        xml,
        &[
            ("<s:Text", "</s:Text>"),
            ("<faultstring>", "</faultstring>"),
            ("<wsman:Message>", "</wsman:Message>"),
        ],
    )
    .map(|text| match text.find('>') {
        Some(gt) => text[gt + 1..].to_string(),
        None => text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf16le_encoding_matches_powershell() {
        // "dir" as UTF-16LE
        assert_eq!(utf16le_bytes("dir"), vec![0x64, 0, 0x69, 0, 0x72, 0]);
    }

    #[test]
    fn test_extract_first_with_namespace_fallback() {
        let xml = "<a><ShellId>9A1E</ShellId></a>";
        let patterns = [
            ("<rsp:ShellId>", "</rsp:ShellId>"),
            ("<ShellId>", "</ShellId>"),
        ];
        assert_eq!(extract_first(xml, &patterns).unwrap(), "9A1E");
    }

    #[test]
    fn test_extract_selector() {
        let xml = r#"<wsman:SelectorSet><wsman:Selector Name="ShellId">ABC-123</wsman:Selector></wsman:SelectorSet>"#;
        assert_eq!(extract_selector(xml, "ShellId").unwrap(), "ABC-123");
        assert!(extract_selector(xml, "CommandId").is_none());
    }

    #[test]
    fn test_extract_streams_filters_by_name() {
        let out = BASE64.encode("hello");
        let err = BASE64.encode("oops");
        let xml = format!(
            r#"<rsp:Stream Name="stdout" CommandId="c1">{out}</rsp:Stream>
               <rsp:Stream Name="stderr" CommandId="c1">{err}</rsp:Stream>
               <rsp:Stream Name="stdout" CommandId="c1" End="true"/>"#
        );
        let stdout = extract_streams(&xml, "stdout");
        assert_eq!(stdout, vec![out]);
        let stderr = extract_streams(&xml, "stderr");
        assert_eq!(decode_stream(&stderr[0]).unwrap(), b"oops");
    }

    #[test]
    fn test_extract_soap_fault() {
        let xml = r#"<s:Fault><s:Reason><s:Text xml:lang="en-US">Access is denied.</s:Text></s:Reason></s:Fault>"#;
        assert_eq!(extract_soap_fault(xml).unwrap(), "Access is denied.");
    }

    #[test]
    fn test_exit_code_parsing() {
        let xml = "<rsp:CommandState State=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done\"><rsp:ExitCode>5</rsp:ExitCode></rsp:CommandState>";
        let code = extract_first(xml, &[("<rsp:ExitCode>", "</rsp:ExitCode>")])
            .and_then(|c| c.parse::<i32>().ok());
        assert_eq!(code, Some(5));
    }
}