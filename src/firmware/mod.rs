//! Firmware update orchestration.
//!
//! A long-running state machine walking one update through schedule,
//! download, installation and post-reboot verification. Every stage is
//! re-entered on later ticks instead of waiting in place, and every status
//! transition is reported to the Central System exactly once, including
//! across reboots, via the persisted `FirmwareLastReportedStatus`.

pub mod ftp;

pub use ftp::{FtpClient, FtpCloseReason, FtpDownload, FtpError, FtpPoll};

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::firmware_status_notification::FirmwareStatusNotificationRequest;
use rust_ocpp::v1_6::types::FirmwareStatus;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{keys, ConfigValue};
use crate::model::dispatch::{PendingOp, TickCtx};
use crate::support::errors::{CoreError, CoreResult};
use crate::transport::DEFAULT_REQUEST_TIMEOUT;

/// Result of the download phase, as observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Before or during the download.
    NotDownloaded,
    Downloaded,
    DownloadFailed,
}

/// Result of the installation phase, as observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationStatus {
    /// Before or during the installation.
    NotInstalled,
    Installed,
    InstallationFailed,
}

/// Stages of one update run. Strictly sequential; failures route through
/// the retry accounting and end in `InternalError` when exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateStage {
    Idle,
    AwaitDownload,
    Downloading,
    AfterDownload,
    AwaitInstallation,
    Installing,
    Installed,
    InternalError,
}

impl UpdateStage {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::AwaitDownload => "AwaitDownload",
            Self::Downloading => "Downloading",
            Self::AfterDownload => "AfterDownload",
            Self::AwaitInstallation => "AwaitInstallation",
            Self::Installing => "Installing",
            Self::Installed => "Installed",
            Self::InternalError => "InternalError",
        }
    }

    /// A new schedule may replace the update only in these stages.
    fn accepts_schedule(self) -> bool {
        matches!(self, Self::Idle | Self::Installed | Self::InternalError)
    }
}

struct DownloadWriter {
    write: Box<dyn FnMut(&[u8]) -> usize>,
    on_close: Box<dyn FnMut(FtpCloseReason)>,
}

/// Firmware update state machine.
pub struct FirmwareService {
    stage: UpdateStage,
    location: String,
    retrieve_date: DateTime<Utc>,
    retries: u32,
    retry_interval_s: u64,
    delay_until_ms: Option<u64>,

    on_download: Option<Box<dyn FnMut(&str) -> bool>>,
    download_status_input: Option<Box<dyn FnMut() -> DownloadStatus>>,
    download_issued: bool,

    on_install: Option<Box<dyn FnMut(&str) -> bool>>,
    installation_status_input: Option<Box<dyn FnMut() -> InstallationStatus>>,
    installation_issued: bool,

    ftp: Option<Box<dyn FtpClient>>,
    ftp_download: Option<Box<dyn FtpDownload>>,
    download_writer: Option<DownloadWriter>,

    build_number: Option<String>,
    bootstrapped: bool,
    trigger_report: bool,
    last_reported: Option<FirmwareStatus>,
}

impl FirmwareService {
    pub(crate) fn new() -> Self {
        Self {
            stage: UpdateStage::Idle,
            location: String::new(),
            retrieve_date: DateTime::<Utc>::MIN_UTC,
            retries: 0,
            retry_interval_s: 0,
            delay_until_ms: None,
            on_download: None,
            download_status_input: None,
            download_issued: false,
            on_install: None,
            installation_status_input: None,
            installation_issued: false,
            ftp: None,
            ftp_download: None,
            download_writer: None,
            build_number: None,
            bootstrapped: false,
            trigger_report: false,
            last_reported: None,
        }
    }

    // ── Host wiring ────────────────────────────────────────

    /// Identify the currently running firmware; used for post-reboot
    /// verification of an installed update.
    pub fn set_build_number(&mut self, build_number: impl Into<String>) {
        self.build_number = Some(build_number.into());
    }

    pub fn set_on_download(&mut self, f: impl FnMut(&str) -> bool + 'static) {
        self.on_download = Some(Box::new(f));
    }

    pub fn set_download_status_input(&mut self, f: impl FnMut() -> DownloadStatus + 'static) {
        self.download_status_input = Some(Box::new(f));
    }

    pub fn set_on_install(&mut self, f: impl FnMut(&str) -> bool + 'static) {
        self.on_install = Some(Box::new(f));
    }

    pub fn set_installation_status_input(
        &mut self,
        f: impl FnMut() -> InstallationStatus + 'static,
    ) {
        self.installation_status_input = Some(Box::new(f));
    }

    pub fn set_ftp_client(&mut self, client: impl FtpClient + 'static) {
        self.ftp = Some(Box::new(client));
    }

    /// Install the chunk writer for built-in FTP downloads. `write` returns
    /// the number of bytes accepted (0 aborts); `on_close` receives the
    /// reason the connection ended.
    pub fn set_download_file_writer(
        &mut self,
        write: impl FnMut(&[u8]) -> usize + 'static,
        on_close: impl FnMut(FtpCloseReason) + 'static,
    ) {
        self.download_writer = Some(DownloadWriter {
            write: Box::new(write),
            on_close: Box::new(on_close),
        });
    }

    // ── Scheduling ─────────────────────────────────────────

    /// Record an update order from the Central System. Rejected while a
    /// previous update is still making progress.
    pub(crate) fn schedule_firmware_update(
        &mut self,
        location: &str,
        retrieve_date: DateTime<Utc>,
        retries: u32,
        retry_interval_s: u64,
    ) -> CoreResult<()> {
        if location.is_empty() {
            return Err(CoreError::InvalidInput("firmware location must not be empty"));
        }
        if !self.stage.accepts_schedule() {
            return Err(CoreError::FirmwareUpdateInProgress(self.stage.name()));
        }
        info!(
            location,
            %retrieve_date,
            retries,
            retry_interval_s,
            "Firmware update scheduled"
        );
        self.location = location.to_string();
        self.retrieve_date = retrieve_date;
        self.retries = retries.max(1);
        self.retry_interval_s = retry_interval_s;
        self.delay_until_ms = None;
        self.download_issued = false;
        self.installation_issued = false;
        self.ftp_download = None;
        self.stage = UpdateStage::AwaitDownload;
        Ok(())
    }

    /// Current phase mapped onto the OCPP firmware status vocabulary.
    pub fn status(&self) -> FirmwareStatus {
        match self.stage {
            UpdateStage::Idle | UpdateStage::AwaitDownload | UpdateStage::InternalError => {
                FirmwareStatus::Idle
            }
            UpdateStage::Downloading => FirmwareStatus::Downloading,
            UpdateStage::AfterDownload | UpdateStage::AwaitInstallation => {
                FirmwareStatus::Downloaded
            }
            UpdateStage::Installing => FirmwareStatus::Installing,
            UpdateStage::Installed => FirmwareStatus::Installed,
        }
    }

    /// Force a FirmwareStatusNotification on the next tick (TriggerMessage).
    pub(crate) fn trigger_status_notification(&mut self) {
        self.trigger_report = true;
    }

    // ── Tick ───────────────────────────────────────────────

    pub(crate) fn loop_tick(&mut self, ctx: &mut TickCtx, any_tx_active: bool) {
        if !self.bootstrapped {
            self.bootstrap(ctx);
        }

        if self.trigger_report {
            self.trigger_report = false;
            self.submit_notification(ctx, self.status());
        }

        if let Some(until) = self.delay_until_ms {
            if ctx.now_ms < until {
                return;
            }
            self.delay_until_ms = None;
        }

        match self.stage {
            UpdateStage::Idle | UpdateStage::Installed | UpdateStage::InternalError => {}
            UpdateStage::AwaitDownload => {
                if ctx.now >= self.retrieve_date {
                    self.report(ctx, FirmwareStatus::Downloading);
                    self.download_issued = false;
                    self.stage = UpdateStage::Downloading;
                }
            }
            UpdateStage::Downloading => self.drive_download(ctx),
            UpdateStage::AfterDownload => {
                self.stage = UpdateStage::AwaitInstallation;
            }
            UpdateStage::AwaitInstallation => {
                // Quiescence: installation would kill running sessions.
                if !any_tx_active {
                    self.report(ctx, FirmwareStatus::Installing);
                    self.installation_issued = false;
                    self.stage = UpdateStage::Installing;
                }
            }
            UpdateStage::Installing => self.drive_install(ctx),
        }
    }

    /// First tick after boot: reload the report dedup state and check
    /// whether a pending update succeeded across the reboot.
    fn bootstrap(&mut self, ctx: &mut TickCtx) {
        self.bootstrapped = true;
        let persisted = ctx.cfg.string_of(keys::FIRMWARE_LAST_REPORTED_STATUS);
        if !persisted.is_empty() {
            self.last_reported =
                serde_json::from_value(Value::String(persisted.clone())).ok();
            if self.last_reported.is_none() {
                warn!(persisted, "Unreadable persisted firmware status ignored");
            }
        }

        let Some(build) = self.build_number.clone() else {
            return;
        };
        let previous = ctx.cfg.string_of(keys::FIRMWARE_PREVIOUS_BUILD_NUMBER);
        if !previous.is_empty() && previous != build {
            info!(
                previous = previous.as_str(),
                current = build.as_str(),
                "Firmware build changed across reboot; update verified"
            );
            self.stage = UpdateStage::Idle;
            self.report(ctx, FirmwareStatus::Installed);
        }
        if previous != build {
            ctx.cfg
                .store_internal(keys::FIRMWARE_PREVIOUS_BUILD_NUMBER, ConfigValue::String(build));
        }
    }

    fn drive_download(&mut self, ctx: &mut TickCtx) {
        if !self.download_issued {
            self.download_issued = true;
            if let Some(on_download) = self.on_download.as_mut() {
                if !on_download(&self.location) {
                    warn!("Download callback refused to start");
                    self.download_failed(ctx);
                    return;
                }
            } else if self.download_writer.is_some() {
                let Some(ftp) = self.ftp.as_mut() else {
                    warn!("Download writer configured without an FTP client");
                    self.download_failed(ctx);
                    return;
                };
                match ftp.open_download(&self.location) {
                    Ok(download) => self.ftp_download = Some(download),
                    Err(e) => {
                        warn!(error = %e, "FTP download failed to open");
                        self.download_failed(ctx);
                        return;
                    }
                }
            } else {
                warn!("No download mechanism configured");
                self.download_failed(ctx);
                return;
            }
        }

        if self.on_download.is_some() {
            match self.download_status_input.as_mut().map(|f| f()) {
                Some(DownloadStatus::NotDownloaded) => {}
                Some(DownloadStatus::DownloadFailed) => self.download_failed(ctx),
                // Without a status input, the issued callback is the signal.
                Some(DownloadStatus::Downloaded) | None => self.download_succeeded(ctx),
            }
            return;
        }

        let Some(download) = self.ftp_download.as_mut() else {
            return;
        };
        let Some(writer) = self.download_writer.as_mut() else {
            return;
        };
        let mut aborted = false;
        let outcome = download.poll(&mut |chunk| {
            let accepted = (writer.write)(chunk);
            if accepted == 0 {
                aborted = true;
            }
            accepted
        });
        match outcome {
            FtpPoll::Active => {
                if aborted {
                    (writer.on_close)(FtpCloseReason::Aborted);
                    self.ftp_download = None;
                    self.download_failed(ctx);
                }
            }
            FtpPoll::Closed(reason) => {
                (writer.on_close)(reason);
                self.ftp_download = None;
                if reason == FtpCloseReason::Completed && !aborted {
                    self.download_succeeded(ctx);
                } else {
                    self.download_failed(ctx);
                }
            }
        }
    }

    fn download_succeeded(&mut self, ctx: &mut TickCtx) {
        info!("Firmware download complete");
        self.report(ctx, FirmwareStatus::Downloaded);
        self.stage = UpdateStage::AfterDownload;
    }

    /// Failure leaves `DownloadFailed` unreported until the last attempt.
    fn download_failed(&mut self, ctx: &mut TickCtx) {
        self.ftp_download = None;
        if self.retries > 1 {
            self.retries -= 1;
            info!(
                retries_left = self.retries,
                retry_interval_s = self.retry_interval_s,
                "Firmware download failed; retrying"
            );
            self.download_issued = false;
            self.stage = UpdateStage::AwaitDownload;
            self.delay_until_ms = Some(ctx.now_ms + self.retry_interval_s * 1000);
        } else {
            warn!("Firmware download failed; no retries left");
            self.report(ctx, FirmwareStatus::DownloadFailed);
            self.stage = UpdateStage::InternalError;
        }
    }

    fn drive_install(&mut self, ctx: &mut TickCtx) {
        if !self.installation_issued {
            self.installation_issued = true;
            if let Some(on_install) = self.on_install.as_mut() {
                if !on_install(&self.location) {
                    warn!("Install callback refused to start");
                    self.install_failed(ctx);
                    return;
                }
            } else if self.installation_status_input.is_none() {
                // No installer wired up: an external component (usually the
                // host's bootloader) takes over from here.
                info!("No installer configured; handing over to the host");
                self.report(ctx, FirmwareStatus::Installed);
                self.stage = UpdateStage::Installed;
                return;
            }
        }

        match self.installation_status_input.as_mut().map(|f| f()) {
            Some(InstallationStatus::NotInstalled) => {}
            Some(InstallationStatus::InstallationFailed) => self.install_failed(ctx),
            Some(InstallationStatus::Installed) | None => {
                info!("Firmware installed");
                self.report(ctx, FirmwareStatus::Installed);
                self.stage = UpdateStage::Installed;
            }
        }
    }

    fn install_failed(&mut self, ctx: &mut TickCtx) {
        if self.retries > 1 {
            self.retries -= 1;
            info!(retries_left = self.retries, "Installation failed; retrying");
            self.installation_issued = false;
            self.stage = UpdateStage::AwaitInstallation;
            self.delay_until_ms = Some(ctx.now_ms + self.retry_interval_s * 1000);
        } else {
            warn!("Installation failed; no retries left");
            self.report(ctx, FirmwareStatus::InstallationFailed);
            self.stage = UpdateStage::InternalError;
        }
    }

    // ── Status reporting ───────────────────────────────────

    /// Report a transition exactly once; duplicates (including across
    /// reboots) are suppressed via the persisted last reported status.
    fn report(&mut self, ctx: &mut TickCtx, status: FirmwareStatus) {
        if self.last_reported.as_ref() == Some(&status) {
            debug!(?status, "Firmware status unchanged; not re-reporting");
            return;
        }
        self.submit_notification(ctx, status.clone());
        let encoded = serde_json::to_value(&status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        ctx.cfg.store_internal(
            keys::FIRMWARE_LAST_REPORTED_STATUS,
            ConfigValue::String(encoded),
        );
        self.last_reported = Some(status);
    }

    fn submit_notification(&mut self, ctx: &mut TickCtx, status: FirmwareStatus) {
        let request = FirmwareStatusNotificationRequest { status };
        ctx.submit(
            PendingOp::FirmwareStatusNotification,
            "FirmwareStatusNotification",
            serde_json::to_value(&request).unwrap_or_default(),
            DEFAULT_REQUEST_TIMEOUT,
        );
    }
}
