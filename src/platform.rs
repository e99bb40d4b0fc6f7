//! ESP-IDF implementations of the engine's hardware boundaries
//!
//! - [`HttpTransport`]: `EspHttpConnection` over the station WiFi link
//! - [`UartLink`]: UART byte pipe for the R307 sensor
//! - [`mount_storage`]: SPIFFS at [`STORAGE_MOUNT`]

use std::time::{Duration, Instant};

use embedded_svc::http::client::Client;
use embedded_svc::http::{Method as HttpMethod, Status};
use embedded_svc::io::{Read, Write};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::delay::{FreeRtos, TickType};
use esp_idf_hal::modem::Modem;
use esp_idf_hal::uart::UartDriver;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use log::{info, warn};

use punchclock::remote::{Method, Response, Transport, TransportError};
use punchclock::sensor::r307::SensorLink;
use punchclock::sensor::SensorError;
use punchclock::Config;

/// VFS mount point of the SPIFFS partition
pub const STORAGE_MOUNT: &str = "/spiffs";

/// Responses larger than this are refused (mapping table tops out near 5 KiB)
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Minimum spacing between WiFi reconnect attempts
const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Mount SPIFFS, formatting it on first boot
pub fn mount_storage() -> anyhow::Result<()> {
    let conf = esp_idf_sys::esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    esp_idf_sys::esp!(unsafe { esp_idf_sys::esp_vfs_spiffs_register(&conf) })?;
    info!("storage mounted at {}", STORAGE_MOUNT);
    Ok(())
}

/// Bring up station mode; a failed first connect is not fatal
pub fn start_wifi(
    modem: Modem,
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    config: &Config,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sysloop.clone(), Some(nvs))?, sysloop)?;

    let auth_method = if config.wifi_password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow::anyhow!("wifi_ssid longer than 32 bytes"))?,
        password: config
            .wifi_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow::anyhow!("wifi_password longer than 64 bytes"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;

    match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
        Ok(()) => info!("wifi connected to {}", config.wifi_ssid),
        Err(e) => warn!("wifi not connected ({}), starting offline", e),
    }
    Ok(wifi)
}

pub struct HttpTransport {
    wifi: BlockingWifi<EspWifi<'static>>,
    base_url: String,
    timeout: Duration,
    last_reconnect: Option<Instant>,
}

impl HttpTransport {
    pub fn new(wifi: BlockingWifi<EspWifi<'static>>, config: &Config) -> Self {
        Self {
            wifi,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.http_timeout_ms),
            last_reconnect: None,
        }
    }

    /// Retry the WiFi association, rate limited
    pub fn maintain(&mut self) {
        if self.is_connected() {
            return;
        }
        if self
            .last_reconnect
            .is_some_and(|at| at.elapsed() < RECONNECT_BACKOFF)
        {
            return;
        }
        self.last_reconnect = Some(Instant::now());
        match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
            Ok(()) => info!("wifi reconnected"),
            Err(e) => warn!("wifi reconnect failed: {}", e),
        }
    }

    fn perform(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> anyhow::Result<Response> {
        let connection = EspHttpConnection::new(&HttpConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        })?;
        let mut client = Client::wrap(connection);

        let url = format!("{}{}", self.base_url, path);
        let content_length = body.map_or(0, <[u8]>::len).to_string();
        let headers = [
            ("content-type", "application/json"),
            ("content-length", content_length.as_str()),
        ];
        let http_method = match method {
            Method::Get => HttpMethod::Get,
            Method::Post => HttpMethod::Post,
        };

        let mut request = client.request(http_method, &url, &headers)?;
        if let Some(body) = body {
            request.write_all(body)?;
            request.flush()?;
        }
        let mut response = request.submit()?;
        let status = response.status();

        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = response.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            if out.len() + n > MAX_BODY_BYTES {
                anyhow::bail!("response body over {} bytes", MAX_BODY_BYTES);
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(Response { status, body: out })
    }
}

impl Transport for HttpTransport {
    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn request(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Response, TransportError> {
        self.perform(method, path, body)
            .map_err(|e| TransportError(e.to_string()))
    }
}

/// UART link to the fingerprint sensor
pub struct UartLink {
    uart: UartDriver<'static>,
}

impl UartLink {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self { uart }
    }
}

impl SensorLink for UartLink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SensorError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = self
                .uart
                .write(rest)
                .map_err(|e| SensorError::Link(e.to_string()))?;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, SensorError> {
        self.uart
            .read(buf, TickType::new_millis(u64::from(timeout_ms)).ticks())
            .map_err(|e| SensorError::Link(e.to_string()))
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }
}
