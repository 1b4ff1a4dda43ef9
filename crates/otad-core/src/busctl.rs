//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "RAUC update backend driven through busctl."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! [`UpdateBackend`] talking to the RAUC D-Bus service by shelling out to
//! `busctl --json=short`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use otad_common::config::{BackendConfig, BusKind};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::{InstallOptions, InstallProgress, SlotStatus, UpdateBackend, OPERATION_INSTALLING};

const RAUC_SERVICE: &str = "de.pengutronix.rauc";
const RAUC_OBJECT: &str = "/";
const RAUC_INSTALLER: &str = "de.pengutronix.rauc.Installer";

#[derive(Debug, Clone)]
pub struct BusctlBackend {
    busctl: PathBuf,
    bus: BusKind,
    poll_interval: Duration,
}

impl BusctlBackend {
    pub fn new(bus: BusKind) -> Self {
        Self::from_config(&BackendConfig {
            bus,
            ..BackendConfig::default()
        })
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            busctl: config.busctl.clone(),
            bus: config.bus,
            poll_interval: config.poll_interval,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Value> {
        let bus_flag = match self.bus {
            BusKind::System => "--system",
            BusKind::Session => "--user",
        };
        let output = Command::new(&self.busctl)
            .arg(bus_flag)
            .arg("--json=short")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.busctl.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("busctl {} exited with {}: {}", args.join(" "), output.status, stderr.trim());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout).context("busctl returned malformed json")
    }

    async fn property(&self, name: &str) -> Result<Value> {
        let reply = self
            .run(&["get-property", RAUC_SERVICE, RAUC_OBJECT, RAUC_INSTALLER, name])
            .await
            .with_context(|| format!("failed to read {name}"))?;
        data(reply)
    }

    async fn string_property(&self, name: &str) -> Result<String> {
        match self.property(name).await? {
            Value::String(value) => Ok(value),
            other => Err(anyhow!("{name} is not a string: {other}")),
        }
    }
}

#[async_trait]
impl UpdateBackend for BusctlBackend {
    async fn boot_slot(&self) -> Result<String> {
        self.string_property("BootSlot").await
    }

    async fn slot_status(&self) -> Result<Vec<SlotStatus>> {
        let reply = self
            .run(&["call", RAUC_SERVICE, RAUC_OBJECT, RAUC_INSTALLER, "GetSlotStatus"])
            .await
            .context("failed to call GetSlotStatus")?;
        parse_slot_status(data(reply)?)
    }

    async fn compatible(&self) -> Result<String> {
        self.string_property("Compatible").await
    }

    async fn install_bundle(&self, url: &str, options: InstallOptions) -> Result<()> {
        let previous_error = self.string_property("LastError").await?;
        let ignore_incompatible = if options.ignore_incompatible { "true" } else { "false" };
        info!(bundle_url = %url, "handing bundle to rauc");
        self.run(&[
            "call",
            RAUC_SERVICE,
            RAUC_OBJECT,
            RAUC_INSTALLER,
            "InstallBundle",
            "sa{sv}",
            url,
            "1",
            "ignore-incompatible",
            "b",
            ignore_incompatible,
        ])
        .await
        .context("InstallBundle call failed")?;

        loop {
            match self.string_property("Operation").await {
                Ok(operation) if operation != OPERATION_INSTALLING => {
                    debug!(operation = %operation, "rauc left installing state");
                    break;
                }
                Ok(_) => {}
                // A failed read does not end the wait.
                Err(err) => debug!(error = %format!("{err:#}"), "failed to read rauc operation"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let last_error = self.string_property("LastError").await?;
        if !last_error.is_empty() && last_error != previous_error {
            bail!("rauc reported: {last_error}");
        }
        Ok(())
    }

    async fn progress(&self) -> Result<InstallProgress> {
        parse_progress(self.property("Progress").await?)
    }

    async fn operation(&self) -> Result<String> {
        self.string_property("Operation").await
    }
}

fn data(reply: Value) -> Result<Value> {
    match reply {
        Value::Object(mut fields) => fields
            .remove("data")
            .ok_or_else(|| anyhow!("busctl reply carries no data")),
        other => Err(anyhow!("unexpected busctl reply: {other}")),
    }
}

/// Parse the `a(sa{sv})` reply of `GetSlotStatus`.
fn parse_slot_status(data: Value) -> Result<Vec<SlotStatus>> {
    let slots = data
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("slot status is not an array"))?;
    slots
        .iter()
        .map(|slot| {
            let name = slot
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("slot entry without name"))?;
            let mut attributes = BTreeMap::new();
            if let Some(fields) = slot.get(1).and_then(Value::as_object) {
                for (key, variant) in fields {
                    attributes.insert(key.clone(), variant_to_string(variant));
                }
            }
            Ok(SlotStatus {
                name: name.to_owned(),
                attributes,
            })
        })
        .collect()
}

/// Parse the `(isi)` Progress property.
fn parse_progress(data: Value) -> Result<InstallProgress> {
    let int_at = |index: usize| {
        data.get(index)
            .and_then(Value::as_i64)
            .and_then(|value| i32::try_from(value).ok())
    };
    match (int_at(0), data.get(1).and_then(Value::as_str), int_at(2)) {
        (Some(percentage), Some(message), Some(depth)) => Ok(InstallProgress {
            percentage,
            message: message.to_owned(),
            depth,
        }),
        _ => Err(anyhow!("malformed progress: {data}")),
    }
}

fn variant_to_string(variant: &Value) -> String {
    match variant.get("data").unwrap_or(variant) {
        Value::String(value) => value.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slot_status_reply_is_flattened() {
        let reply = json!({
            "type": "a(sa{sv})",
            "data": [[
                ["rootfs.0", {
                    "bootname": {"type": "s", "data": "A"},
                    "bundle.version": {"type": "s", "data": "1.8.1"},
                    "size": {"type": "t", "data": 4096}
                }],
                ["rootfs.1", {"bootname": {"type": "s", "data": "B"}}]
            ]]
        });
        let slots = parse_slot_status(data(reply).unwrap()).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].name, "rootfs.0");
        assert_eq!(slots[0].attribute("bundle.version"), Some("1.8.1"));
        assert_eq!(slots[0].attribute("size"), Some("4096"));
        assert!(slots[1].is_boot_slot("B"));
    }

    #[test]
    fn progress_tuple_is_parsed() {
        let progress = parse_progress(json!([42, "Copying image", 2])).unwrap();
        assert_eq!(progress.percentage, 42);
        assert_eq!(progress.message, "Copying image");
        assert_eq!(progress.depth, 2);
        assert!(parse_progress(json!([42])).is_err());
    }

    #[test]
    fn reply_without_data_is_rejected() {
        assert!(data(json!({"type": "s"})).is_err());
        assert!(data(Value::Null).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drives_rauc_through_busctl_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("busctl");
        let state = dir.path().display().to_string();
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
case "$7" in
  Compatible) echo '{{"type":"s","data":"cbpifw-raspberrypi3-64"}}' ;;
  BootSlot) echo '{{"type":"s","data":"A"}}' ;;
  Operation) echo '{{"type":"s","data":"idle"}}' ;;
  Progress) echo '{{"type":"(isi)","data":[100,"Installing done.",1]}}' ;;
  LastError) printf '{{"type":"s","data":"%s"}}\n' "$(cat {state}/last_error 2>/dev/null)" ;;
  GetSlotStatus) echo '{{"type":"a(sa{{sv}})","data":[[["rootfs.0",{{"bootname":{{"type":"s","data":"A"}}}}]]]}}' ;;
  InstallBundle)
    echo "$1 $8 $9 ${{10}} ${{11}} ${{12}} ${{13}}" >> {state}/calls
    case "$9" in *broken*) echo "signature verification failed" > {state}/last_error ;; esac
    ;;
  *) echo "unknown member $7" >&2; exit 1 ;;
esac
"#
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = BusctlBackend::from_config(&BackendConfig {
            busctl: script,
            bus: BusKind::System,
            poll_interval: Duration::from_millis(10),
        });
        assert_eq!(backend.compatible().await.unwrap(), "cbpifw-raspberrypi3-64");
        assert_eq!(backend.boot_slot().await.unwrap(), "A");
        assert_eq!(backend.operation().await.unwrap(), "idle");
        assert_eq!(backend.progress().await.unwrap().percentage, 100);
        assert_eq!(backend.slot_status().await.unwrap()[0].name, "rootfs.0");

        backend
            .install_bundle("https://example.com/a_update.bin", InstallOptions::default())
            .await
            .unwrap();
        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        assert_eq!(
            calls.trim(),
            "--system sa{sv} https://example.com/a_update.bin 1 ignore-incompatible b false"
        );

        let err = backend
            .install_bundle("https://example.com/broken_update.bin", InstallOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("signature verification failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_wait_survives_failed_operation_reads() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("busctl");
        let state = dir.path().display().to_string();
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
case "$7" in
  LastError) echo '{{"type":"s","data":""}}' ;;
  InstallBundle) ;;
  Operation)
    n=$(cat {state}/operation_reads 2>/dev/null || echo 0)
    n=$((n + 1))
    echo "$n" > {state}/operation_reads
    case "$n" in
      1|3) echo "Connection timed out" >&2; exit 1 ;;
      2) echo '{{"type":"s","data":"installing"}}' ;;
      *) echo '{{"type":"s","data":"idle"}}' ;;
    esac
    ;;
  *) echo "unknown member $7" >&2; exit 1 ;;
esac
"#
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = BusctlBackend::from_config(&BackendConfig {
            busctl: script,
            bus: BusKind::System,
            poll_interval: Duration::from_millis(10),
        });
        backend
            .install_bundle("https://example.com/a_update.bin", InstallOptions::default())
            .await
            .unwrap();

        let reads = std::fs::read_to_string(dir.path().join("operation_reads")).unwrap();
        assert_eq!(reads.trim(), "4");
    }
}
