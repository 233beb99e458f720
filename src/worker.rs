//! The X11 worker thread and its control-side pipe client.
//!
//! A single dedicated thread owns the X11 connection: it blocks on the
//! event queue, dispatches grabbed key presses, and services commands that
//! the control core writes onto the Request pipe. Because `wait_for_event`
//! blocks indefinitely, the control side wakes the worker by sending a
//! synthetic ClientMessage to an invisible 1×1 window the worker created
//! for exactly this purpose.
//!
//! Asynchronous X11 errors (a rejected grab, for instance) arrive in the
//! worker's event stream and are forwarded over the Error pipe; the control
//! side polls that pipe for a short window after every grab/ungrab.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context as _;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt, CreateWindowAux, EventMask,
    GrabMode, KeyPressEvent, ModMask, Window, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::actions::BusHandle;
use crate::keys;
use crate::pipe::{self, Pipe, PipeError};
use crate::registry::{GrabReply, Registry, X11Shortcut};

const OP_STRING_TO_KEYCODE: u64 = 0;
const OP_KEYCODE_TO_STRING: u64 = 1;
const OP_GRAB_KEY: u64 = 2;
const OP_UNGRAB_KEY: u64 = 3;
const OP_GRAB_KEYBOARD: u64 = 4;
const OP_UNGRAB_KEYBOARD: u64 = 5;

/// How long the control side waits for an asynchronous X11 error after a
/// grab-style request, in milliseconds.
const X11_ERROR_WINDOW_MS: u16 = 10;

/// Compact record of an asynchronous X11 error, as carried on the Error
/// pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X11ErrorReport {
    pub error_code: u8,
    pub major_opcode: u8,
    pub minor_opcode: u16,
    pub sequence: u16,
    pub bad_value: u32,
}

impl X11ErrorReport {
    pub const WIRE_LEN: usize = 10;

    pub fn to_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut bytes = [0u8; Self::WIRE_LEN];
        bytes[0] = self.error_code;
        bytes[1] = self.major_opcode;
        bytes[2..4].copy_from_slice(&self.minor_opcode.to_ne_bytes());
        bytes[4..6].copy_from_slice(&self.sequence.to_ne_bytes());
        bytes[6..10].copy_from_slice(&self.bad_value.to_ne_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; Self::WIRE_LEN]) -> Self {
        Self {
            error_code: bytes[0],
            major_opcode: bytes[1],
            minor_opcode: u16::from_ne_bytes([bytes[2], bytes[3]]),
            sequence: u16::from_ne_bytes([bytes[4], bytes[5]]),
            bad_value: u32::from_ne_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        }
    }
}

/// The X11 operations the control core needs. The production
/// implementation talks to the worker thread through the pipes; tests
/// substitute a fake keymap that records the grab set.
pub trait X11Backend: Send + Sync {
    fn string_to_keycode(&self, name: &str) -> Result<u8, PipeError>;
    fn keycode_to_string(&self, keycode: u8) -> Result<String, PipeError>;
    /// Install a grab; false when the server rejected it.
    fn grab_key(&self, binding: X11Shortcut) -> Result<bool, PipeError>;
    fn ungrab_key(&self, binding: X11Shortcut) -> Result<bool, PipeError>;
    /// Capture the whole keyboard for an interactive grab; false when the
    /// server reported an error.
    fn grab_keyboard(&self) -> Result<bool, PipeError>;
    fn ungrab_keyboard(&self) -> Result<bool, PipeError>;
    /// Drain one grab-resolution payload from the Response pipe.
    fn read_grab_payload(&self) -> Result<GrabReply, PipeError>;
    /// Interrupt the worker's blocking event wait.
    fn wake(&self);
}

/// Control-side client: serializes commands onto the Request pipe and
/// reads the per-command reply from the Response pipe. Callers hold the
/// data lock across each round-trip, so commands never interleave.
pub struct X11Pipes {
    conn: Arc<RustConnection>,
    wakeup_window: Window,
    request_wr: OwnedFd,
    response_rd: OwnedFd,
    error_rd: OwnedFd,
}

impl X11Pipes {
    /// Harvest an asynchronous X11 error, waiting up to the fixed window.
    fn check_x11_error(&self) -> Result<bool, PipeError> {
        if !pipe::poll_readable(&self.error_rd, X11_ERROR_WINDOW_MS)? {
            return Ok(false);
        }
        let mut bytes = [0u8; X11ErrorReport::WIRE_LEN];
        pipe::read_full(&self.error_rd, &mut bytes)?;
        let report = X11ErrorReport::from_bytes(bytes);
        debug!(
            "X11 rejected request {}:{} with error {} (value {:#x})",
            report.major_opcode, report.minor_opcode, report.error_code, report.bad_value
        );
        Ok(true)
    }
}

impl X11Backend for X11Pipes {
    fn string_to_keycode(&self, name: &str) -> Result<u8, PipeError> {
        pipe::write_word(&self.request_wr, OP_STRING_TO_KEYCODE)?;
        pipe::write_bytes(&self.request_wr, name.as_bytes())?;
        self.wake();
        pipe::read_byte(&self.response_rd)
    }

    fn keycode_to_string(&self, keycode: u8) -> Result<String, PipeError> {
        pipe::write_word(&self.request_wr, OP_KEYCODE_TO_STRING)?;
        pipe::write_byte(&self.request_wr, keycode)?;
        self.wake();
        let name = pipe::read_bytes(&self.response_rd)?;
        if self.check_x11_error()? {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&name).into_owned())
    }

    fn grab_key(&self, binding: X11Shortcut) -> Result<bool, PipeError> {
        pipe::write_word(&self.request_wr, OP_GRAB_KEY)?;
        pipe::write_byte(&self.request_wr, binding.0)?;
        pipe::write_u32(&self.request_wr, binding.1)?;
        self.wake();
        pipe::read_byte(&self.response_rd)?;
        if self.check_x11_error()? {
            // The fan-out may have partially succeeded; mirror it back out.
            self.ungrab_key(binding)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn ungrab_key(&self, binding: X11Shortcut) -> Result<bool, PipeError> {
        pipe::write_word(&self.request_wr, OP_UNGRAB_KEY)?;
        pipe::write_byte(&self.request_wr, binding.0)?;
        pipe::write_u32(&self.request_wr, binding.1)?;
        self.wake();
        pipe::read_byte(&self.response_rd)?;
        Ok(!self.check_x11_error()?)
    }

    fn grab_keyboard(&self) -> Result<bool, PipeError> {
        pipe::write_word(&self.request_wr, OP_GRAB_KEYBOARD)?;
        self.wake();
        let status = pipe::read_i32(&self.response_rd)?;
        debug!("XGrabKeyboard returned {}", status);
        Ok(!self.check_x11_error()?)
    }

    fn ungrab_keyboard(&self) -> Result<bool, PipeError> {
        pipe::write_word(&self.request_wr, OP_UNGRAB_KEYBOARD)?;
        self.wake();
        pipe::read_byte(&self.response_rd)?;
        Ok(!self.check_x11_error()?)
    }

    fn read_grab_payload(&self) -> Result<GrabReply, PipeError> {
        let cancelled = pipe::read_byte(&self.response_rd)? != 0;
        let shortcut = if cancelled {
            String::new()
        } else {
            String::from_utf8_lossy(&pipe::read_bytes(&self.response_rd)?).into_owned()
        };
        Ok(GrabReply { shortcut, cancelled })
    }

    fn wake(&self) {
        let event = ClientMessageEvent::new(32, self.wakeup_window, 0u32, [0u32; 5]);
        let _ = self
            .conn
            .send_event(false, self.wakeup_window, EventMask::NO_EVENT, event);
        let _ = self.conn.flush();
    }
}

/// Running worker thread plus the control-side backend.
pub struct WorkerHandle {
    pub backend: Arc<X11Pipes>,
    pub active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Orderly worker shutdown: clear the active flag, kick the event
    /// wait, and join.
    pub fn shutdown(&mut self) {
        self.active.store(false, Ordering::Release);
        self.backend.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("X11 worker thread panicked during shutdown");
            }
        }
    }
}

/// Create the pipes, start the worker thread and wait for its readiness
/// byte. `grab_resolved` fires once per interactive-grab resolution the
/// worker has written onto the Response pipe.
pub fn start(
    data: Arc<Mutex<Registry>>,
    bus: BusHandle,
    grab_resolved: UnboundedSender<()>,
) -> anyhow::Result<WorkerHandle> {
    let request = pipe::create().context("cannot create X11 request pipe")?;
    let response = pipe::create().context("cannot create X11 response pipe")?;
    let error = pipe::create().context("cannot create error signal pipe")?;

    let active = Arc::new(AtomicBool::new(true));
    let (startup_tx, startup_rx) = std::sync::mpsc::channel();

    let Pipe { read: request_rd, write: request_wr } = request;
    let Pipe { read: response_rd, write: response_wr } = response;
    let Pipe { read: error_rd, write: error_wr } = error;

    let worker_active = active.clone();
    let thread = std::thread::Builder::new()
        .name("x11-worker".into())
        .spawn(move || {
            worker_main(
                data,
                bus,
                worker_active,
                request_rd,
                response_wr,
                error_wr,
                grab_resolved,
                startup_tx,
            )
        })
        .context("cannot start X11 worker thread")?;

    let signal = pipe::read_byte(&response_rd).context("cannot read X11 start signal")?;
    if signal != 0 {
        anyhow::bail!("cannot start X11 thread");
    }
    let (conn, wakeup_window) = startup_rx
        .recv()
        .context("X11 worker did not report its connection")?;

    Ok(WorkerHandle {
        backend: Arc::new(X11Pipes {
            conn,
            wakeup_window,
            request_wr,
            response_rd,
            error_rd,
        }),
        active,
        thread: Some(thread),
    })
}

type StartupInfo = (Arc<RustConnection>, Window);

#[allow(clippy::too_many_arguments)]
fn worker_main(
    data: Arc<Mutex<Registry>>,
    bus: BusHandle,
    active: Arc<AtomicBool>,
    request_rd: OwnedFd,
    response_wr: OwnedFd,
    error_wr: OwnedFd,
    grab_resolved: UnboundedSender<()>,
    startup_tx: std::sync::mpsc::Sender<StartupInfo>,
) {
    let (conn, root, wakeup_window, screen_num) = match init_x11() {
        Ok(parts) => parts,
        Err(e) => {
            error!("cannot open X11 display: {:#}", e);
            let _ = pipe::write_byte(&response_wr, 1);
            return;
        }
    };

    let _ = startup_tx.send((conn.clone(), wakeup_window));
    if let Err(e) = pipe::write_byte(&response_wr, 0) {
        error!("cannot write X11 start signal: {}", e);
        return;
    }

    info!("X11 worker ready on screen {}", screen_num);

    let worker = Worker {
        conn,
        root,
        data,
        bus,
        active,
        request_rd,
        response_wr,
        error_wr,
        grab_resolved,
        lock_masks: keys::lock_combinations(),
    };
    worker.run();
}

/// Open the display, select KeyPress on the root window and create the
/// wakeup window.
fn init_x11() -> anyhow::Result<(Arc<RustConnection>, Window, Window, usize)> {
    let (conn, screen_num) = RustConnection::connect(None)?;
    let conn = Arc::new(conn);
    let root = conn.setup().roots[screen_num].root;

    conn.change_window_attributes(
        root,
        &ChangeWindowAttributesAux::new().event_mask(EventMask::KEY_PRESS),
    )?
    .check()?;

    let wakeup_window = conn.generate_id()?;
    conn.create_window(
        x11rb::COPY_DEPTH_FROM_PARENT,
        wakeup_window,
        root,
        -1,
        -1,
        1,
        1,
        0,
        WindowClass::INPUT_ONLY,
        x11rb::COPY_FROM_PARENT,
        &CreateWindowAux::new().event_mask(EventMask::STRUCTURE_NOTIFY),
    )?
    .check()?;
    conn.flush()?;

    Ok((conn, root, wakeup_window, screen_num))
}

struct Worker {
    conn: Arc<RustConnection>,
    root: Window,
    data: Arc<Mutex<Registry>>,
    bus: BusHandle,
    active: Arc<AtomicBool>,
    request_rd: OwnedFd,
    response_wr: OwnedFd,
    error_wr: OwnedFd,
    grab_resolved: UnboundedSender<()>,
    lock_masks: Vec<u32>,
}

impl Worker {
    fn run(&self) {
        while self.active.load(Ordering::Acquire) {
            let event = match self.conn.wait_for_event() {
                Ok(event) => event,
                Err(e) => {
                    error!("X11 connection lost: {}", e);
                    break;
                }
            };
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            match event {
                Event::KeyPress(press) => self.key_press(press),
                Event::Error(x11_error) => self.forward_error(
                    x11_error.error_code,
                    x11_error.major_opcode,
                    x11_error.minor_opcode,
                    x11_error.sequence,
                    x11_error.bad_value,
                ),
                _ => self.service_requests(),
            }
        }

        // Release every remaining grab before the connection goes away.
        let _ = self.conn.ungrab_key(0u8, self.root, ModMask::ANY);
        let _ = self.conn.flush();
        info!("X11 worker stopped");
    }

    fn key_press(&self, event: KeyPressEvent) {
        let modifiers = u32::from(u16::from(event.state)) & keys::SIGNIFICANT_MASK;
        let mut data = self.data.lock();

        if data.grabbing_shortcut {
            self.grab_mode_key(&mut data, event.detail, modifiers);
            return;
        }

        let Some(shortcut) = data.shortcut_by_x11.get(&(event.detail, modifiers)).cloned()
        else {
            debug!(
                "KeyPress {:#06x} {:#04x} without binding",
                modifiers, event.detail
            );
            return;
        };
        debug!(
            "KeyPress {:#06x} {:#04x} '{}'",
            modifiers, event.detail, shortcut
        );
        data.dispatch(&shortcut, &self.bus);
    }

    /// One key press while the keyboard is captured for an interactive
    /// grab. Modifier keys and disallowed keys keep the capture alive;
    /// anything else resolves it.
    fn grab_mode_key(&self, data: &mut Registry, keycode: u8, modifiers: u32) {
        let keysym = self.primary_keysym(keycode);

        let mut cancelled = false;
        let mut shortcut = String::new();
        if keysym != 0 {
            if keys::is_escape(keysym, modifiers) {
                cancelled = true;
            } else if keys::is_modifier(keysym)
                || !data.allow_grab.is_allowed(keysym, modifiers)
            {
                return;
            } else if let Some(name) = keys::keysym_name(keysym) {
                shortcut = keys::compose_shortcut(modifiers, &name);
            }
        }

        data.grabbing_shortcut = false;
        let _ = self.conn.ungrab_keyboard(x11rb::CURRENT_TIME);
        let _ = self.conn.flush();

        if let Err(e) = self.write_grab_payload(cancelled, &shortcut) {
            error!("cannot write to X11 response pipe: {}", e);
            self.active.store(false, Ordering::Release);
            return;
        }
        data.grab_payload_pending = true;
        let _ = self.grab_resolved.send(());
    }

    fn write_grab_payload(&self, cancelled: bool, shortcut: &str) -> Result<(), PipeError> {
        pipe::write_byte(&self.response_wr, cancelled as u8)?;
        if !cancelled {
            pipe::write_bytes(&self.response_wr, shortcut.as_bytes())?;
        }
        Ok(())
    }

    fn forward_error(
        &self,
        error_code: u8,
        major_opcode: u8,
        minor_opcode: u16,
        sequence: u16,
        bad_value: u32,
    ) {
        info!(
            "X11 error: code {} request {}:{} sequence {} value {:#x}",
            error_code, major_opcode, minor_opcode, sequence, bad_value
        );
        let report = X11ErrorReport {
            error_code,
            major_opcode,
            minor_opcode,
            sequence,
            bad_value,
        };
        if pipe::write_full(&self.error_wr, &report.to_bytes()).is_err() {
            error!("cannot write to error signal pipe");
            self.active.store(false, Ordering::Release);
        }
    }

    /// Serve every command currently queued on the Request pipe.
    fn service_requests(&self) {
        loop {
            match pipe::poll_readable(&self.request_rd, 0) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    error!("cannot poll X11 request pipe: {}", e);
                    self.active.store(false, Ordering::Release);
                    return;
                }
            }
            if let Err(e) = self.serve_one() {
                error!("X11 request pipe failed: {}", e);
                self.active.store(false, Ordering::Release);
                return;
            }
        }
    }

    fn serve_one(&self) -> Result<(), PipeError> {
        let opcode = pipe::read_word(&self.request_rd)?;
        match opcode {
            OP_STRING_TO_KEYCODE => {
                let name = pipe::read_bytes(&self.request_rd)?;
                let name = String::from_utf8_lossy(&name);
                let keycode = keys::keysym_from_name(&name)
                    .map(|keysym| self.keysym_to_keycode(keysym))
                    .unwrap_or(0);
                pipe::write_byte(&self.response_wr, keycode)
            }
            OP_KEYCODE_TO_STRING => {
                let keycode = pipe::read_byte(&self.request_rd)?;
                let name = match self.primary_keysym(keycode) {
                    0 => None,
                    keysym => keys::keysym_name(keysym),
                };
                pipe::write_bytes(&self.response_wr, name.unwrap_or_default().as_bytes())
            }
            OP_GRAB_KEY => {
                let keycode = pipe::read_byte(&self.request_rd)?;
                let mask = pipe::read_u32(&self.request_rd)?;
                for locks in &self.lock_masks {
                    let _ = self.conn.grab_key(
                        false,
                        self.root,
                        ModMask::from((mask | locks) as u16),
                        keycode,
                        GrabMode::ASYNC,
                        GrabMode::ASYNC,
                    );
                }
                let _ = self.conn.flush();
                pipe::write_byte(&self.response_wr, 0)
            }
            OP_UNGRAB_KEY => {
                let keycode = pipe::read_byte(&self.request_rd)?;
                let mask = pipe::read_u32(&self.request_rd)?;
                for locks in &self.lock_masks {
                    let _ = self.conn.ungrab_key(
                        keycode,
                        self.root,
                        ModMask::from((mask | locks) as u16),
                    );
                }
                let _ = self.conn.flush();
                pipe::write_byte(&self.response_wr, 0)
            }
            OP_GRAB_KEYBOARD => {
                let result = self
                    .conn
                    .grab_keyboard(
                        false,
                        self.root,
                        x11rb::CURRENT_TIME,
                        GrabMode::ASYNC,
                        GrabMode::ASYNC,
                    )
                    .ok()
                    .and_then(|cookie| cookie.reply().ok())
                    .map(|reply| i32::from(u8::from(reply.status)))
                    .unwrap_or(-1);
                pipe::write_i32(&self.response_wr, result)?;
                self.data.lock().grabbing_shortcut = true;
                Ok(())
            }
            OP_UNGRAB_KEYBOARD => {
                let _ = self.conn.ungrab_keyboard(x11rb::CURRENT_TIME);
                let _ = self.conn.flush();
                pipe::write_byte(&self.response_wr, 0)?;
                self.data.lock().grabbing_shortcut = false;
                Ok(())
            }
            other => {
                error!("unknown X11 request opcode {}", other);
                self.active.store(false, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Primary keysym of a keycode, preferring the shifted symbol for
    /// letter keys so canonical names come out as `T` rather than `t`.
    fn primary_keysym(&self, keycode: u8) -> u32 {
        let reply = match self.conn.get_keyboard_mapping(keycode, 1) {
            Ok(cookie) => match cookie.reply() {
                Ok(reply) => reply,
                Err(_) => return 0,
            },
            Err(_) => return 0,
        };
        let keysyms = &reply.keysyms;
        if keysyms.is_empty() || keysyms[0] == 0 {
            return 0;
        }
        if keysyms.len() >= 2 && keysyms[1] != 0 && keys::is_latin_lowercase(keysyms[0]) {
            keysyms[1]
        } else {
            keysyms[0]
        }
    }

    /// Lowest keycode producing `keysym` in any column, 0 when unmapped.
    fn keysym_to_keycode(&self, keysym: u32) -> u8 {
        let setup = self.conn.setup();
        let min = setup.min_keycode;
        let max = setup.max_keycode;
        let reply = match self.conn.get_keyboard_mapping(min, max - min + 1) {
            Ok(cookie) => match cookie.reply() {
                Ok(reply) => reply,
                Err(_) => return 0,
            },
            Err(_) => return 0,
        };
        let per_keycode = reply.keysyms_per_keycode as usize;
        if per_keycode == 0 {
            return 0;
        }
        for (index, row) in reply.keysyms.chunks(per_keycode).enumerate() {
            if row.contains(&keysym) {
                return min + index as u8;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_report_round_trip() {
        let report = X11ErrorReport {
            error_code: 10,
            major_opcode: 33,
            minor_opcode: 0,
            sequence: 4242,
            bad_value: 0xdead_beef,
        };
        assert_eq!(X11ErrorReport::from_bytes(report.to_bytes()), report);
    }
}
