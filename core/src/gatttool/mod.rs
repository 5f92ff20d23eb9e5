//! Backend driving BlueZ's `gatttool` command line client.
//!
//! `gatttool` opens a fresh link for every invocation, so `connect` only
//! records the target address. Each read, write or listen spawns one
//! process, bounded by a timeout, and is retried with exponential backoff
//! when the output carries neither a success nor a failure marker.

pub mod output;
pub mod runner;

use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::ble::{adapter_index, Backend, BackendKind, NotificationHandler, LISTEN_ENABLE};
use crate::error::BackendError;
use crate::models::{DeviceAddress, DiscoveredDevice, Handle};

pub use output::{bytes_to_hex, find_hex_bytes, notification_lines, scan_results, NotificationLine};
pub use runner::{CommandOutput, CommandRunner, Invocation, SystemRunner};

use output::{READ_FAILED_MARKER, SUCCESS_MARKER, WRITE_FAILED_MARKER};

pub const DEFAULT_PROGRAM: &str = "gatttool";

#[derive(Clone, Debug, PartialEq)]
pub struct GatttoolSettings {
    pub program: String,
    /// Used for `lescan`.
    pub scan_program: String,
    pub adapter: String,
    /// Per attempt limit for reads and writes.
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Delay before the first retry, doubled for every further retry.
    pub initial_backoff: Duration,
}

impl Default for GatttoolSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            scan_program: "hcitool".to_string(),
            adapter: "hci0".to_string(),
            timeout: Duration::from_secs(20),
            retries: 3,
            initial_backoff: Duration::from_secs(10),
        }
    }
}

/// How one attempt's output was judged.
enum Attempt<T> {
    Done(T),
    Fatal(String),
    Retry,
}

pub struct GatttoolBackend {
    settings: GatttoolSettings,
    runner: Box<dyn CommandRunner>,
    address: Option<DeviceAddress>,
}

impl GatttoolBackend {
    pub fn new(settings: GatttoolSettings) -> Self {
        Self::with_runner(settings, SystemRunner::default())
    }

    pub fn with_runner(settings: GatttoolSettings, runner: impl CommandRunner + 'static) -> Self {
        Self {
            settings,
            runner: Box::new(runner),
            address: None,
        }
    }

    pub fn settings(&self) -> &GatttoolSettings {
        &self.settings
    }

    /// Whether the default `gatttool` can be started on this host.
    pub fn check_available() -> bool {
        Self::program_available(&GatttoolSettings::default())
    }

    /// Whether the program named in `settings` can be started.
    pub fn program_available(settings: &GatttoolSettings) -> bool {
        check_program(&settings.program)
    }

    fn target(&self) -> Result<DeviceAddress, BackendError> {
        self.address.ok_or(BackendError::NotConnected)
    }

    fn write_args(&self, address: &DeviceAddress, handle: Handle, value: &[u8]) -> Vec<String> {
        vec![
            format!("--device={}", address),
            format!("--addr-type={}", address.address_type),
            "--char-write-req".to_string(),
            "-a".to_string(),
            handle.to_string(),
            "-n".to_string(),
            bytes_to_hex(value),
            format!("--adapter={}", self.settings.adapter),
        ]
    }

    fn read_args(&self, address: &DeviceAddress, handle: Handle) -> Vec<String> {
        vec![
            format!("--device={}", address),
            format!("--addr-type={}", address.address_type),
            "--char-read".to_string(),
            "-a".to_string(),
            handle.to_string(),
            format!("--adapter={}", self.settings.adapter),
        ]
    }

    /// Run `args` until `judge` accepts or rejects the output, or the
    /// attempts run out.
    fn run_with_retries<T>(
        &mut self,
        operation: &str,
        args: Vec<String>,
        timeout: Duration,
        mut judge: impl FnMut(&str) -> Attempt<T>,
    ) -> Result<T, BackendError> {
        let invocation = Invocation::new(self.settings.program.clone(), args);
        let attempts = self.settings.retries + 1;
        let mut delay = self.settings.initial_backoff;
        let mut last_timed_out = false;

        for attempt in 1..=attempts {
            debug!(%invocation, attempt, attempts, ?timeout, "running gatttool");
            let output = self.runner.run(&invocation, timeout)?;
            last_timed_out = output.timed_out;
            if output.timed_out {
                debug!(operation, attempt, "gatttool interrupted after timeout");
            }

            let text = output.stdout.trim_matches(|c| c == ' ' || c == '\n' || c == '\t');
            debug!(operation, output = text, "gatttool returned");
            match judge(text) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(message) => return Err(BackendError::failure(message)),
                Attempt::Retry => {}
            }

            if attempt < attempts {
                warn!(operation, attempt, attempts, ?delay, "no usable output, retrying");
                self.runner.backoff(delay);
                delay = delay.saturating_mul(2);
            }
        }

        if last_timed_out {
            Err(BackendError::timeout(operation, attempts))
        } else {
            Err(BackendError::failure(format!(
                "{} returned no data after {} attempts",
                operation, attempts
            )))
        }
    }
}

impl Backend for GatttoolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gatttool
    }

    fn connect(&mut self, address: &DeviceAddress) -> Result<(), BackendError> {
        self.address = Some(*address);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.address = None;
    }

    fn is_connected(&self) -> bool {
        self.address.is_some()
    }

    fn write_handle(&mut self, handle: Handle, value: &[u8]) -> Result<(), BackendError> {
        let address = self.target()?;
        let args = self.write_args(&address, handle, value);
        let timeout = self.settings.timeout;
        self.run_with_retries("char-write-req", args, timeout, |out| {
            if out.contains(WRITE_FAILED_MARKER) {
                Attempt::Fatal(format!("error writing handle {}: {}", handle, out))
            } else if out.contains(SUCCESS_MARKER) {
                Attempt::Done(())
            } else {
                Attempt::Retry
            }
        })
    }

    fn read_handle(&mut self, handle: Handle) -> Result<Vec<u8>, BackendError> {
        let address = self.target()?;
        let args = self.read_args(&address, handle);
        let timeout = self.settings.timeout;
        self.run_with_retries("char-read", args, timeout, |out| {
            if out.contains(READ_FAILED_MARKER) {
                return Attempt::Fatal(format!("read error for handle {}: {}", handle, out));
            }
            match find_hex_bytes(out) {
                Some(bytes) => Attempt::Done(bytes),
                None => Attempt::Retry,
            }
        })
    }

    fn wait_for_notification(
        &mut self,
        handle: Handle,
        on_notify: &mut NotificationHandler<'_>,
        timeout: Duration,
    ) -> Result<bool, BackendError> {
        let address = self.target()?;
        let mut args = self.write_args(&address, handle, &LISTEN_ENABLE);
        args.push("--listen".to_string());

        let frames = self.run_with_retries("listen", args, timeout, |out| {
            if out.contains(WRITE_FAILED_MARKER) {
                Attempt::Fatal(format!("error enabling notifications on {}: {}", handle, out))
            } else if out.contains(SUCCESS_MARKER) {
                Attempt::Done(notification_lines(out))
            } else {
                Attempt::Retry
            }
        })?;

        debug!(count = frames.len(), %handle, "notifications received");
        let received = !frames.is_empty();
        for frame in frames {
            if let Some(value_handle) = frame.handle {
                trace!(%handle, %value_handle, "notification");
            }
            on_notify(handle, frame.data);
        }
        Ok(received)
    }

    fn scan_for_devices(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BackendError> {
        adapter_index(&self.settings.adapter)?;
        let invocation = Invocation::new(
            self.settings.scan_program.clone(),
            ["-i", self.settings.adapter.as_str(), "lescan"],
        );
        // lescan never terminates by itself; the timeout ends the scan
        let output = self.runner.run(&invocation, timeout)?;
        if output.stderr.contains("Operation not permitted")
            || output.stderr.contains("scan parameters failed")
        {
            return Err(BackendError::AdapterUnavailable(format!(
                "lescan on {} needs root privileges: {}",
                self.settings.adapter,
                output.stderr.trim()
            )));
        }
        Ok(scan_results(&output.stdout))
    }
}

/// Whether `program` can be spawned at all.
pub fn check_program(program: &str) -> bool {
    let spawned = Command::new(program)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match spawned {
        Ok(_) => true,
        Err(e) => {
            debug!(program, error = %e, "program not available");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RunLog {
        invocations: Vec<Invocation>,
        timeouts: Vec<Duration>,
        backoffs: Vec<Duration>,
    }

    /// Replays canned outputs and records what it was asked to do.
    struct ScriptedRunner {
        outputs: VecDeque<io::Result<CommandOutput>>,
        log: Arc<Mutex<RunLog>>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&mut self, invocation: &Invocation, timeout: Duration) -> io::Result<CommandOutput> {
            let mut log = self.log.lock().unwrap();
            log.invocations.push(invocation.clone());
            log.timeouts.push(timeout);
            self.outputs
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }

        fn backoff(&mut self, delay: Duration) {
            self.log.lock().unwrap().backoffs.push(delay);
        }
    }

    fn stdout(text: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            stdout: text.to_string(),
            ..Default::default()
        })
    }

    fn timed_out(text: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            stdout: text.to_string(),
            timed_out: true,
            ..Default::default()
        })
    }

    fn backend(outputs: Vec<io::Result<CommandOutput>>) -> (GatttoolBackend, Arc<Mutex<RunLog>>) {
        let log = Arc::new(Mutex::new(RunLog::default()));
        let runner = ScriptedRunner {
            outputs: outputs.into(),
            log: log.clone(),
        };
        let mut backend = GatttoolBackend::with_runner(GatttoolSettings::default(), runner);
        backend
            .connect(&"58:2D:34:10:29:1C".parse().unwrap())
            .unwrap();
        (backend, log)
    }

    #[test]
    fn test_not_connected() {
        let (mut backend, log) = backend(vec![]);
        backend.disconnect();
        assert_eq!(backend.read_handle(Handle(0x03)).unwrap_err().kind(), ErrorKind::NotConnected);
        assert_eq!(
            backend.write_handle(Handle(0x10), &[1, 0]).unwrap_err().kind(),
            ErrorKind::NotConnected
        );
        assert!(log.lock().unwrap().invocations.is_empty());
    }

    #[test]
    fn test_write_command_line() {
        let (mut backend, log) =
            backend(vec![stdout("Characteristic value was written successfully\n")]);
        backend.write_handle(Handle(0x10), &[0x01, 0x00]).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log.invocations[0].to_string(),
            concat!(
                "gatttool --device=58:2D:34:10:29:1C --addr-type=public ",
                "--char-write-req -a 0x10 -n 0100 --adapter=hci0"
            )
        );
        assert_eq!(log.timeouts[0], Duration::from_secs(20));
        assert!(log.backoffs.is_empty());
    }

    #[test]
    fn test_retry_backoff_doubles() {
        for failures in 0..=3u32 {
            let mut outputs: Vec<_> =
                (0..failures).map(|_| stdout("connect: Device busy")).collect();
            outputs.push(stdout("Characteristic value was written successfully"));
            let (mut backend, log) = backend(outputs);

            backend.write_handle(Handle(0x10), &[0x01, 0x00]).unwrap();

            let log = log.lock().unwrap();
            assert_eq!(log.invocations.len() as u32, failures + 1);
            let total: Duration = log.backoffs.iter().sum();
            assert_eq!(total, Duration::from_secs(10 * (2u64.pow(failures) - 1)));
        }
    }

    #[test]
    fn test_retries_exhausted() {
        let (mut backend, log) = backend((0..10).map(|_| stdout("")).collect());
        let err = backend.read_handle(Handle(0x24)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert!(err.to_string().contains("4 attempts"), "{err}");

        let log = log.lock().unwrap();
        assert_eq!(log.invocations.len(), 4);
        assert_eq!(
            log.backoffs,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40)
            ]
        );
    }

    #[test]
    fn test_timeouts_exhausted() {
        let (mut backend, log) = backend((0..4).map(|_| timed_out("")).collect());
        let err = backend.write_handle(Handle(0x10), &[0x01]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(log.lock().unwrap().invocations.len(), 4);
    }

    #[test]
    fn test_timed_out_attempt_is_retried() {
        let (mut backend, log) = backend(vec![
            timed_out(""),
            stdout("Characteristic value/descriptor: 5d"),
        ]);
        assert_eq!(backend.read_handle(Handle(0x18)).unwrap(), vec![0x5d]);
        assert_eq!(log.lock().unwrap().invocations.len(), 2);
    }

    #[test]
    fn test_failure_markers_are_not_retried() {
        let (mut writer, write_log) = backend(vec![stdout(
            "Characteristic Write Request failed: Attribute can't be written",
        )]);
        let err = writer.write_handle(Handle(0x24), &[0x00]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert_eq!(write_log.lock().unwrap().invocations.len(), 1);

        let (mut reader, read_log) = backend(vec![stdout(
            "Characteristic value/descriptor read failed: Invalid handle",
        )]);
        assert!(reader.read_handle(Handle(0x99)).is_err());
        assert_eq!(read_log.lock().unwrap().invocations.len(), 1);
    }

    #[test]
    fn test_read_returns_bytes() {
        let (mut backend, log) = backend(vec![stdout(
            "Characteristic value/descriptor: 4d 4a 5f 48 54 5f 56 31 00 \n",
        )]);
        assert_eq!(backend.read_handle(Handle(0x03)).unwrap(), b"MJ_HT_V1\0".to_vec());
        assert_eq!(
            log.lock().unwrap().invocations[0].args,
            vec![
                "--device=58:2D:34:10:29:1C",
                "--addr-type=public",
                "--char-read",
                "-a",
                "0x03",
                "--adapter=hci0"
            ]
        );
    }

    #[test]
    fn test_listen_delivers_frames_in_order() {
        let (mut backend, log) = backend(vec![timed_out(
            "Characteristic value was written successfully
Notification handle = 0x000e value: 54 3d 32 35 2e 36 20 48 3d 32 33 2e 36 00
Notification handle = 0x000e value: 54 3d 32 35 2e 37 20 48 3d 32 33 2e 35 00
",
        )]);
        let mut frames = Vec::new();
        let got = backend
            .wait_for_notification(
                Handle(0x10),
                &mut |h, data| frames.push((h, data)),
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(got);
        assert_eq!(frames.len(), 2);
        // the subscribed handle, not the value handle gatttool prints
        assert_eq!(frames[0].0, Handle(0x10));
        assert_eq!(frames[1].0, Handle(0x10));
        assert_eq!(&frames[0].1[..6], b"T=25.6");
        assert_eq!(&frames[1].1[..6], b"T=25.7");

        let log = log.lock().unwrap();
        assert_eq!(log.timeouts[0], Duration::from_secs(10));
        assert_eq!(log.invocations[0].args.last().map(String::as_str), Some("--listen"));
        assert!(log.invocations[0].args.contains(&"0100".to_string()));
    }

    #[test]
    fn test_listen_without_notifications() {
        let (mut backend, _) =
            backend(vec![timed_out("Characteristic value was written successfully\n")]);
        let mut frames = Vec::new();
        let got = backend
            .wait_for_notification(
                Handle(0x10),
                &mut |h, data| frames.push((h, data)),
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(!got);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_missing_binary_is_adapter_unavailable() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gatttool");
        let (mut backend, _) = backend(vec![Err(missing)]);
        assert_eq!(
            backend.read_handle(Handle(0x03)).unwrap_err().kind(),
            ErrorKind::AdapterUnavailable
        );
    }

    #[test]
    fn test_availability_uses_configured_program() {
        let settings = GatttoolSettings {
            program: "sh".to_string(),
            ..GatttoolSettings::default()
        };
        assert!(GatttoolBackend::program_available(&settings));
        let settings = GatttoolSettings {
            program: "/nonexistent/gatttool".to_string(),
            ..GatttoolSettings::default()
        };
        assert!(!GatttoolBackend::program_available(&settings));
    }

    #[test]
    fn test_scan_parses_lescan() {
        let (mut backend, log) =
            backend(vec![timed_out("LE Scan ...\n4C:65:A8:DD:1C:2B MJ_HT_V1\n")]);
        let devices = backend.scan_for_devices(Duration::from_secs(5)).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(log.lock().unwrap().invocations[0].to_string(), "hcitool -i hci0 lescan");
    }

    #[test]
    fn test_scan_requires_privileges() {
        let (mut backend, _) = backend(vec![Ok(CommandOutput {
            stderr: "Set scan parameters failed: Operation not permitted".to_string(),
            ..Default::default()
        })]);
        assert_eq!(
            backend.scan_for_devices(Duration::from_secs(5)).unwrap_err().kind(),
            ErrorKind::AdapterUnavailable
        );
    }
}
