//! Punchclock - fingerprint attendance terminal firmware
//!
//! Each loop iteration:
//! 1. Samples the button; a completed press runs sync, enrollment, or erase
//! 2. Polls the sensor; a matched finger becomes an attendance record, sent
//!    to the server or queued on flash while offline
//! 3. Runs a sync cycle when the link comes back or the interval elapses
//! 4. Retries WiFi if it dropped

#[cfg(target_os = "espidf")]
mod button;
#[cfg(target_os = "espidf")]
mod platform;

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use std::path::Path;

    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::gpio::{AnyIOPin, PinDriver};
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_hal::uart::{config::Config as UartConfig, UartDriver};
    use esp_idf_hal::units::Hertz;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::log::EspLogger;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::sntp::EspSntp;
    use log::{error, info, warn};

    use punchclock::clock::SystemClock;
    use punchclock::config::{Config, CONFIG_FILE};
    use punchclock::sensor::r307::R307;
    use punchclock::status::{LogStatus, Status, StatusSink};
    use punchclock::Engine;

    use crate::button::Button;
    use crate::platform::{HttpTransport, UartLink, STORAGE_MOUNT};

    /// Factory password of R307 modules
    const SENSOR_PASSWORD: u32 = 0;
    const SENSOR_BAUD: u32 = 57_600;
    const LOOP_DELAY_MS: u32 = 50;

    esp_idf_sys::link_patches();
    EspLogger::initialize_default();

    info!("Punchclock v{} starting", env!("CARGO_PKG_VERSION"));

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let storage_mounted = match platform::mount_storage() {
        Ok(()) => true,
        Err(e) => {
            error!("storage not mounted ({}), running degraded", e);
            false
        }
    };
    let config = match Config::load_or_default(&Path::new(STORAGE_MOUNT).join(CONFIG_FILE)) {
        Ok(config) => config,
        Err(e) => {
            warn!("config rejected ({}), using defaults", e);
            Config::default()
        }
    };

    let wifi = platform::start_wifi(peripherals.modem, sysloop, nvs, &config)?;
    // Wall-clock time for attendance records; runs in the background
    let _sntp = EspSntp::new_default()?;
    let transport = HttpTransport::new(wifi, &config);

    let uart = UartDriver::new(
        peripherals.uart1,
        peripherals.pins.gpio17,
        peripherals.pins.gpio16,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::default().baudrate(Hertz(SENSOR_BAUD)),
    )?;
    let mut sensor = R307::new(UartLink::new(uart), config.slot_capacity);
    match sensor.verify_password(SENSOR_PASSWORD) {
        Ok(()) => info!("Fingerprint sensor ready"),
        Err(e) => warn!("Fingerprint sensor handshake failed: {}", e),
    }

    let mut button = Button::new(PinDriver::input(peripherals.pins.gpio0)?)?;
    info!("Button initialized on GPIO0");

    let mut engine = Engine::open(config, transport, sensor, SystemClock::new())?;
    let mut status = LogStatus::default();
    if !storage_mounted {
        engine.raise_storage_fault(&mut status);
    }
    status.show(&Status::Idle);

    info!("Entering event loop");
    loop {
        if let Some(action) = button.poll() {
            engine.handle(action, &mut status);
        }
        engine.tick(&mut status);
        engine.remote_mut().transport_mut().maintain();

        // Small delay to prevent busy-spinning
        FreeRtos::delay_ms(LOOP_DELAY_MS);
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!(
        "punchclock {} is ESP32 firmware; build it for an espidf target \
         (e.g. --target xtensa-esp32s3-espidf). The engine is in the library crate.",
        env!("CARGO_PKG_VERSION")
    );
    std::process::exit(1);
}
