//! Helpers around the BlueZ management tools.
//!
//! Raw advertisement and scan-response payloads cannot be programmed
//! through the D-Bus advertising API (BlueZ assembles those PDUs itself),
//! so the advertiser drives `btmgmt` instead, which talks to the kernel's
//! management interface and accepts both payloads verbatim. The one HCI
//! command we need on top of that (pinning the advertising address) goes
//! through `hcitool cmd`.
//!
//! Both tools usually require CAP_NET_ADMIN; the `sudo` flag prepends
//! `sudo` to every invocation.

use std::process::Output;

use log::{debug, error, info, warn};
use tokio::process::Command;

use crate::api::BDAddr;
use crate::{Error, Result};

/// OGF of the LE controller command group.
const OGF_LE_CTL: &str = "0x08";
/// OCF of LE Set Advertising Set Random Address.
const OCF_SET_ADV_SET_RANDOM_ADDR: &str = "0x0035";

/// A handle on one local controller, addressed by its `hciN` index.
#[derive(Debug, Clone)]
pub struct MgmtClient {
    index: u16,
    sudo: bool,
}

impl MgmtClient {
    pub fn new(index: u16, sudo: bool) -> Self {
        MgmtClient { index, sudo }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// Enable or disable the stack's own advertising. Custom instances
    /// added with `add_advertisement` are not affected.
    pub async fn advertising(&self, enable: bool) -> Result<()> {
        self.run_btmgmt(&["advertising", if enable { "on" } else { "off" }])
            .await
            .map(|_| ())
    }

    /// Set the controller name answered to name requests.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.run_btmgmt(&["name", name]).await.map(|_| ())
    }

    /// Program one connectable advertising instance with raw advertisement
    /// and scan-response payloads. Instance numbers start at 1; adding an
    /// instance starts advertising it immediately.
    pub async fn add_advertisement(
        &self,
        instance: u8,
        advertisement: &[u8],
        scan_response: &[u8],
    ) -> Result<()> {
        let instance = instance.to_string();
        let advertisement = hex::encode(advertisement);
        let scan_response = hex::encode(scan_response);
        let mut args = vec!["add-adv"];
        if !advertisement.is_empty() {
            args.extend(["-d", advertisement.as_str()]);
        }
        if !scan_response.is_empty() {
            args.extend(["-s", scan_response.as_str()]);
        }
        args.push("-c");
        args.push(instance.as_str());
        self.run_btmgmt(&args).await.map(|_| ())
    }

    /// Remove every advertising instance this tool added.
    pub async fn clear_advertisements(&self) -> Result<()> {
        self.run_btmgmt(&["clr-adv"]).await.map(|_| ())
    }

    /// Pin the address used by one advertising instance so the controller
    /// stops randomising it per cycle. Issues LE Set Advertising Set
    /// Random Address with the target address in little-endian order and
    /// checks the status octet of the command-complete event.
    pub async fn set_advertising_address(&self, instance: u8, address: BDAddr) -> Result<()> {
        let iface = format!("hci{}", self.index);
        let mut args: Vec<String> = vec![
            "-i".to_string(),
            iface,
            "cmd".to_string(),
            OGF_LE_CTL.to_string(),
            OCF_SET_ADV_SET_RANDOM_ADDR.to_string(),
            format!("{:02x}", instance),
        ];
        for octet in address.to_le_octets() {
            args.push(format!("{:02x}", octet));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_tool("hcitool", &arg_refs).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let status = parse_event_status(&stdout).ok_or_else(|| {
            Error::Bluetooth(format!("no HCI event status in hcitool output: {}", stdout))
        })?;
        if status != 0x00 {
            return Err(Error::Bluetooth(format!(
                "setting advertising address failed with status {:#04x}{}",
                status,
                if status == 0x0c { " (command disallowed)" } else { "" },
            )));
        }
        info!("advertising address pinned to {}", address);
        Ok(())
    }

    async fn run_btmgmt(&self, args: &[&str]) -> Result<Output> {
        let index = self.index.to_string();
        let mut full = vec!["--index", &index];
        full.extend(args);
        self.run_tool("btmgmt", &full).await
    }

    async fn run_tool(&self, program: &str, args: &[&str]) -> Result<Output> {
        let mut command = if self.sudo {
            let mut command = Command::new("sudo");
            command.arg(program);
            command
        } else {
            Command::new(program)
        };
        command.args(args);
        info!("executing: {} {}", program, args.join(" "));

        let output = command.output().await.map_err(|err| {
            error!("cannot run {}: {}", program, err);
            Error::Io(err)
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            );
            warn!("in case of missing privileges try running with --sudo");
            return Err(Error::Bluetooth(format!(
                "{} failed: {}",
                program,
                stderr.trim()
            )));
        }
        debug!(
            "command response: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(output)
    }
}

/// Pull the status octet out of `hcitool cmd` output. The line after
/// `> HCI Event:` holds the event payload; its fourth octet is the command
/// status.
pub(crate) fn parse_event_status(stdout: &str) -> Option<u8> {
    let mut lines = stdout.lines();
    lines.find(|line| line.trim_start().starts_with("> HCI Event:"))?;
    let payload = lines.next()?;
    let octets: Vec<&str> = payload.split_whitespace().collect();
    if octets.len() < 4 {
        return None;
    }
    u8::from_str_radix(octets[3], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_success() {
        let output = "\
< HCI Command: ogf 0x08, ocf 0x0035, plen 7
  01 3E 48 DD 4F 23 DC
> HCI Event: 0x0e plen 4
  01 35 20 00
";
        assert_eq!(parse_event_status(output), Some(0x00));
    }

    #[test]
    fn parse_status_disallowed() {
        let output = "\
< HCI Command: ogf 0x08, ocf 0x0035, plen 7
  01 3E 48 DD 4F 23 DC
> HCI Event: 0x0e plen 4
  01 35 20 0C
";
        assert_eq!(parse_event_status(output), Some(0x0c));
    }

    #[test]
    fn parse_status_missing_event() {
        assert_eq!(parse_event_status("no event here"), None);
        assert_eq!(parse_event_status("> HCI Event: 0x0e plen 4"), None);
        assert_eq!(parse_event_status("> HCI Event: 0x0e plen 4\n  01 35"), None);
    }
}
