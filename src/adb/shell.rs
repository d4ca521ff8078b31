// Shell backend: drives the `adb` binary from Android Platform Tools
use super::error::{AdbError, AdbResult};
use super::types::Device;
use std::process::Output;
use tokio::process::Command;

#[derive(Debug)]
pub struct AdbShell {
    pub device: Device,
    pub transport_id: u32,
    pub screen_x: u32,
    pub screen_y: u32,
}

impl AdbShell {
    pub async fn ensure_adb_available() -> AdbResult<()> {
        match Command::new("adb").arg("version").output().await {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(AdbError::CommandFailed {
                command: "adb version".to_string(),
                stderr: format!(
                    "returned non-zero ({}). Ensure Android Platform Tools are properly installed.",
                    out.status
                ),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AdbError::AdbNotFound),
            Err(source) => Err(AdbError::SpawnFailed {
                command: "adb version".to_string(),
                source,
            }),
        }
    }

    /// Run `adb <args>` and require a zero exit status. The child is killed
    /// if the returned future is dropped before it exits.
    async fn run(transport_id: Option<u32>, args: &[&str]) -> AdbResult<Output> {
        let mut cmd = Command::new("adb");
        if let Some(tid) = transport_id {
            cmd.arg("-t").arg(tid.to_string());
        }
        let command = format!("adb {}", args.join(" "));
        let output = cmd
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| AdbError::SpawnFailed {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(AdbError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Connect to the device with the given transport id, or the first
    /// attached device when `None`.
    pub async fn new(transport_id: Option<&str>) -> AdbResult<Self> {
        Self::ensure_adb_available().await?;
        let devices = Self::list_devices().await?;
        if devices.is_empty() {
            return Err(AdbError::NoDevices);
        }
        let device = match transport_id {
            Some(tid) => devices
                .into_iter()
                .find(|d| d.transport_id.as_deref() == Some(tid))
                .ok_or_else(|| AdbError::DeviceNotFound {
                    name: format!("transport_id:{tid}"),
                })?,
            None => devices.into_iter().next().ok_or(AdbError::NoDevices)?,
        };
        let raw_tid = device.transport_id.clone().unwrap_or_default();
        let transport_id = raw_tid
            .parse::<u32>()
            .map_err(|_| AdbError::InvalidTransportId {
                name: device.name.clone(),
                value: raw_tid.clone(),
            })?;
        let (screen_x, screen_y) = Self::get_screen_size(transport_id).await?;
        log::info!(
            "📱 Using device {} (transport_id {transport_id}, screen {screen_x}x{screen_y})",
            device.name
        );
        Ok(Self {
            device,
            transport_id,
            screen_x,
            screen_y,
        })
    }

    /// Select a device by serial, running `adb connect` first for network
    /// devices that are not attached yet.
    pub async fn new_with_device(device_name: &str) -> AdbResult<Self> {
        let devices = Self::list_devices().await?;
        if let Some(device) = devices.iter().find(|d| d.name == device_name) {
            return Self::new(device.transport_id.as_deref()).await;
        }

        log::info!("🔌 Device {device_name} not attached, trying adb connect");
        let output = Command::new("adb")
            .arg("connect")
            .arg(device_name)
            .output()
            .await
            .map_err(|source| AdbError::SpawnFailed {
                command: format!("adb connect {device_name}"),
                source,
            })?;
        let stdout_str = String::from_utf8_lossy(&output.stdout);
        let stderr_str = String::from_utf8_lossy(&output.stderr);
        // adb connect exits 0 even when the connection is refused
        if !output.status.success()
            || stdout_str.contains("Connection refused")
            || stderr_str.contains("Connection refused")
            || stdout_str.contains("failed to connect")
        {
            return Err(AdbError::ConnectFailed {
                name: device_name.to_string(),
                output: format!("{} {}", stdout_str.trim(), stderr_str.trim())
                    .trim()
                    .to_string(),
            });
        }

        let devices = Self::list_devices().await?;
        match devices.iter().find(|d| d.name == device_name) {
            Some(device) => Self::new(device.transport_id.as_deref()).await,
            None => Err(AdbError::DeviceNotFound {
                name: device_name.to_string(),
            }),
        }
    }

    async fn get_screen_size(transport_id: u32) -> AdbResult<(u32, u32)> {
        let output = Self::run(Some(transport_id), &["shell", "wm", "size"]).await?;
        Self::parse_screen_size(&String::from_utf8_lossy(&output.stdout))
    }

    /// Parse `wm size` output. An override size wins over the physical one
    /// since taps are interpreted in override coordinates.
    pub fn parse_screen_size(stdout: &str) -> AdbResult<(u32, u32)> {
        let parse = |prefix: &str| {
            stdout.lines().find_map(|line| {
                let (x, y) = line.trim().strip_prefix(prefix)?.trim().split_once('x')?;
                Some((x.trim().parse::<u32>().ok()?, y.trim().parse::<u32>().ok()?))
            })
        };
        parse("Override size:")
            .or_else(|| parse("Physical size:"))
            .ok_or(AdbError::ScreenSizeParseFailed)
    }

    pub fn parse_devices(output: &str) -> Vec<Device> {
        output
            .lines()
            .skip(1)
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let name = parts.next()?;
                if parts.next()? != "device" {
                    return None;
                }
                let transport_id = parts
                    .find_map(|part| part.strip_prefix("transport_id:"))
                    .map(str::to_string);
                Some(Device {
                    name: name.to_string(),
                    transport_id,
                })
            })
            .collect()
    }

    pub async fn list_devices() -> AdbResult<Vec<Device>> {
        Self::ensure_adb_available().await?;
        let output = Self::run(None, &["devices", "-l"]).await?;
        Ok(Self::parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    /// PNG-encoded screenshot of the current screen.
    pub async fn screen_capture_bytes(&self) -> AdbResult<Vec<u8>> {
        let output = Self::run(Some(self.transport_id), &["exec-out", "screencap", "-p"]).await?;
        Ok(output.stdout)
    }

    pub fn check_bounds(&self, x: u32, y: u32) -> AdbResult<()> {
        if x >= self.screen_x || y >= self.screen_y {
            return Err(AdbError::TapOutOfBounds { x, y });
        }
        Ok(())
    }

    pub async fn tap(&self, x: u32, y: u32) -> AdbResult<()> {
        self.check_bounds(x, y)?;
        let (x, y) = (x.to_string(), y.to_string());
        Self::run(Some(self.transport_id), &["shell", "input", "tap", &x, &y]).await?;
        Ok(())
    }

    pub fn screen_dimensions(&self) -> (u32, u32) {
        (self.screen_x, self.screen_y)
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }
}
