//! Remote execution bridge: SSH and WinRM operations on a
//! [`VirtualMachine`], each wrapped in the deadline retry loop.
//!
//! Transport-level errors are retried until the VM's timeout and then
//! surfaced as `Timeout`. A non-exceptional failure result (failed flag,
//! non-zero remote-management status) classifies once into a domain
//! error carrying the captured output; it is never retried.

use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::info;

use crate::error::{DriverError, DriverResult};
use crate::retry::{retry_until, Attempt};
use crate::types::{CmdOutcome, ScriptOutput, SshTarget, TransferOutcome, WinRmTarget};
use crate::vm::VirtualMachine;

/// Chunk size for WinRM uploads when the caller does not pick one.
pub const WINRM_UPLOAD_STEP: usize = 65536;

impl VirtualMachine {
    // ── SSH ─────────────────────────────────────────────────────────

    /// Run a shell command in the guest. `None` when the VM is
    /// unresolved. The transport's `failed` flag decides failure; a
    /// non-zero exit code alone is returned as data.
    pub async fn ssh(
        &self,
        command: &str,
        use_sudo: bool,
        quiet: bool,
    ) -> DriverResult<Option<CmdOutcome>> {
        let Some(target) = self.ssh_target().await? else {
            return Ok(None);
        };
        let command = if use_sudo {
            format!("sudo {command}")
        } else {
            command.to_string()
        };
        let what = format!("ssh command on '{}'", self.name());
        let transport = Arc::clone(&self.ssh_transport);
        let outcome = self
            .retry_transport(&what, move || {
                let transport = Arc::clone(&transport);
                let target = target.clone();
                let command = command.clone();
                async move { transport.run(&target, &command).await }
            })
            .await?;
        if !quiet && !outcome.stdout.is_empty() {
            info!("{}", outcome.stdout.trim_end());
        }
        if outcome.failed {
            return Err(DriverError::ssh(
                format!(
                    "command on '{}' failed with exit code {}",
                    self.name(),
                    outcome.exit_code
                ),
                format!("stdout: {}; stderr: {}", outcome.stdout, outcome.stderr),
            ));
        }
        Ok(Some(outcome))
    }

    /// Copy a local file into the guest over SFTP.
    pub async fn ssh_upload(
        &self,
        local: &str,
        remote: &str,
        quiet: bool,
    ) -> DriverResult<Option<TransferOutcome>> {
        let Some(target) = self.ssh_target().await? else {
            return Ok(None);
        };
        let what = format!("upload of '{local}' to '{}'", self.name());
        let transport = Arc::clone(&self.ssh_transport);
        let local_owned = local.to_string();
        let remote_owned = remote.to_string();
        let outcome = self
            .retry_transport(&what, move || {
                let transport = Arc::clone(&transport);
                let target = target.clone();
                let local = local_owned.clone();
                let remote = remote_owned.clone();
                async move { transport.upload(&target, &local, &remote).await }
            })
            .await?;
        if outcome.failed {
            return Err(DriverError::upload(format!(
                "upload of '{local}' to '{remote}' on '{}' failed: {}",
                self.name(),
                outcome.message.as_deref().unwrap_or("transfer reported failure")
            )));
        }
        if !quiet {
            info!("uploaded '{local}' to '{remote}' on '{}'", self.name());
        }
        Ok(Some(outcome))
    }

    /// Copy a file out of the guest over SFTP.
    pub async fn ssh_download(
        &self,
        remote: &str,
        local: &str,
        quiet: bool,
    ) -> DriverResult<Option<TransferOutcome>> {
        let Some(target) = self.ssh_target().await? else {
            return Ok(None);
        };
        let what = format!("download of '{remote}' from '{}'", self.name());
        let transport = Arc::clone(&self.ssh_transport);
        let local_owned = local.to_string();
        let remote_owned = remote.to_string();
        let outcome = self
            .retry_transport(&what, move || {
                let transport = Arc::clone(&transport);
                let target = target.clone();
                let local = local_owned.clone();
                let remote = remote_owned.clone();
                async move { transport.download(&target, &remote, &local).await }
            })
            .await?;
        if outcome.failed {
            return Err(DriverError::download(format!(
                "download of '{remote}' from '{}' failed: {}",
                self.name(),
                outcome.message.as_deref().unwrap_or("transfer reported failure")
            )));
        }
        if !quiet {
            info!("downloaded '{remote}' to '{local}' from '{}'", self.name());
        }
        Ok(Some(outcome))
    }

    // ── WinRM ───────────────────────────────────────────────────────

    /// Run a PowerShell script in the guest. `None` when unresolved. A
    /// non-zero status raises `WinRm` with the captured stderr.
    pub async fn winrm(&self, script: &str, quiet: bool) -> DriverResult<Option<ScriptOutput>> {
        let Some(target) = self.winrm_target().await? else {
            return Ok(None);
        };
        let what = format!("winrm script on '{}'", self.name());
        let transport = Arc::clone(&self.winrm_transport);
        let script_owned = script.to_string();
        let output = self
            .retry_transport(&what, move || {
                let transport = Arc::clone(&transport);
                let target = target.clone();
                let script = script_owned.clone();
                async move { transport.run_script(&target, &script).await }
            })
            .await?;
        if !quiet && !output.std_out.is_empty() {
            info!("{}", output.std_out.trim_end());
        }
        if output.status_code != 0 {
            return Err(DriverError::winrm(
                format!(
                    "script on '{}' returned status {}",
                    self.name(),
                    output.status_code
                ),
                output.std_err,
            ));
        }
        Ok(Some(output))
    }

    /// Upload a local file to the guest through WinRM, base64-appending
    /// `step`-sized chunks to a remote temp file and decoding it into
    /// place. A partially written temp file is not rolled back when the
    /// deadline fires mid-transfer.
    pub async fn winrm_upload(
        &self,
        local: &str,
        remote: &str,
        step: Option<usize>,
        quiet: bool,
    ) -> DriverResult<Option<()>> {
        let Some(target) = self.winrm_target().await? else {
            return Ok(None);
        };
        let step = step.unwrap_or(WINRM_UPLOAD_STEP).max(1);
        let data = tokio::fs::read(local).await.map_err(|e| {
            DriverError::upload(format!("cannot read local file '{local}': {e}"))
        })?;
        let staging = format!("{remote}.b64part");

        for chunk in data.chunks(step) {
            let encoded = BASE64.encode(chunk);
            let script = format!("Add-Content -Path '{staging}' -Value '{encoded}'");
            self.winrm_script_with_busy_retry(&target, script, "winrm upload chunk")
                .await?;
        }

        let finalize = format!(
            "$ms = New-Object IO.MemoryStream; \
             foreach ($line in Get-Content -Path '{staging}') {{ \
               $bytes = [Convert]::FromBase64String($line); \
               $ms.Write($bytes, 0, $bytes.Length) \
             }}; \
             [IO.File]::WriteAllBytes('{remote}', $ms.ToArray()); \
             Remove-Item -Path '{staging}'"
        );
        self.winrm_script_with_busy_retry(&target, finalize, "winrm upload finalize")
            .await?;
        if !quiet {
            info!("uploaded '{local}' to '{remote}' on '{}'", self.name());
        }
        Ok(Some(()))
    }

    /// One script invocation where a configured busy marker in stderr is
    /// transient (the file is briefly locked by the remote side) while
    /// any other non-zero status is final.
    async fn winrm_script_with_busy_retry(
        &self,
        target: &WinRmTarget,
        script: String,
        what: &str,
    ) -> DriverResult<ScriptOutput> {
        let transport = Arc::clone(&self.winrm_transport);
        let markers = self.winrm_busy_markers.clone();
        let target = target.clone();
        let name = self.name().to_string();
        retry_until(self.timeout, self.poll_interval, what, move || {
            let transport = Arc::clone(&transport);
            let target = target.clone();
            let script = script.clone();
            let markers = markers.clone();
            let name = name.clone();
            async move {
                match transport.run_script(&target, &script).await {
                    Ok(output) if output.status_code == 0 => Ok(output),
                    Ok(output) => {
                        let busy = markers.iter().any(|m| output.std_err.contains(m));
                        let err = DriverError::winrm(
                            format!(
                                "script on '{name}' returned status {}",
                                output.status_code
                            ),
                            output.std_err,
                        );
                        if busy {
                            Err(Attempt::Transient(err))
                        } else {
                            Err(Attempt::Fatal(err))
                        }
                    }
                    Err(err) => Err(Attempt::Transient(err)),
                }
            }
        })
        .await
    }

    // ── Target assembly ─────────────────────────────────────────────

    async fn ssh_target(&self) -> DriverResult<Option<SshTarget>> {
        if self.object_ref().is_none() {
            return Ok(None);
        }
        let credentials = self
            .ssh_credentials
            .clone()
            .ok_or_else(|| DriverError::config("no ssh credentials configured"))?;
        let Some(address) = self.ip(true).await? else {
            return Ok(None);
        };
        Ok(Some(SshTarget {
            host: address.to_string(),
            credentials,
        }))
    }

    async fn winrm_target(&self) -> DriverResult<Option<WinRmTarget>> {
        if self.object_ref().is_none() {
            return Ok(None);
        }
        let credentials = self
            .winrm_credentials
            .clone()
            .ok_or_else(|| DriverError::config("no winrm credentials configured"))?;
        let Some(address) = self.ip(true).await? else {
            return Ok(None);
        };
        Ok(Some(WinRmTarget {
            host: address.to_string(),
            credentials,
        }))
    }

    /// Run a transport call through the deadline loop; every transport
    /// error is transient.
    async fn retry_transport<T, F, Fut>(&self, what: &str, mut call: F) -> DriverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        retry_until(self.timeout, self.poll_interval, what, move || {
            let attempt = call();
            async move { attempt.await.map_err(Attempt::Transient) }
        })
        .await
    }
}
