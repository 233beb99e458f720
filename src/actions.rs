//! Action variants bound to shortcuts and their activation paths.
//!
//! Three kinds exist: spawning a detached child process, a one-shot D-Bus
//! method call, and a notification delivered to a peer that bound itself to
//! the shortcut. Activation never blocks the dispatching thread: process
//! children are disowned and bus traffic is handed to the runtime.

use std::ffi::OsStr;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use tracing::{debug, warn};
use zbus::zvariant::OwnedObjectPath;

/// Interface a bound peer is expected to implement at its object path.
pub const CLIENT_INTERFACE: &str = "org.hotkeyd.client";

/// Coordinates of a one-shot method call.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub service: String,
    pub path: OwnedObjectPath,
    pub interface: String,
    pub method: String,
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    /// Spawn `program` with `args`, detached from the daemon.
    Command { program: String, args: Vec<String> },
    /// Perform a remote method call.
    Method(MethodCall),
    /// Notify the peer bound at (`service`, `path`). `active` tracks the
    /// presence of the peer on the bus; `persistent` bindings survive the
    /// peer's disappearance.
    Service {
        service: String,
        path: OwnedObjectPath,
        persistent: bool,
        active: bool,
    },
}

/// A shortcut-bound action.
#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub description: String,
    pub enabled: bool,
}

impl Action {
    pub fn new(kind: ActionKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            enabled: true,
        }
    }

    /// Wire-visible type tag.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ActionKind::Command { .. } => "command",
            ActionKind::Method(_) => "method",
            ActionKind::Service { .. } => "dbus",
        }
    }

    /// Run the action. Returns whether activation was issued; disabled
    /// actions and inactive service bindings report failure so that the
    /// `first`/`last` dispatch policies fall through to the next binding.
    pub fn activate(&self, bus: &BusHandle) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.kind {
            ActionKind::Command { program, args } => match spawn_detached(program, args) {
                Ok(()) => true,
                Err(e) => {
                    warn!("cannot run '{}': {}", program, e);
                    false
                }
            },
            ActionKind::Method(call) => bus.call_method(call),
            ActionKind::Service { service, path, active, .. } => {
                if !*active {
                    debug!("service action for '{}' @ {} is inactive", service, path);
                    return false;
                }
                bus.notify_activated(service, path)
            }
        }
    }
}

/// Spawn a disowned child so the daemon never collects it.
fn spawn_detached<S: AsRef<OsStr>>(program: S, args: &[String]) -> io::Result<()> {
    let mut command = Command::new(program);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    // Double-fork so the grandchild is reparented to init.
    unsafe {
        command.pre_exec(|| {
            match libc::fork() {
                -1 => return Err(io::Error::last_os_error()),
                0 => (),
                _ => libc::_exit(0),
            }

            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        });
    }

    command.spawn()?.wait()?;

    Ok(())
}

/// Session-bus access shared with the dispatching thread.
#[derive(Clone)]
pub struct BusHandle {
    connection: Option<zbus::Connection>,
    runtime: tokio::runtime::Handle,
}

impl BusHandle {
    pub fn new(connection: zbus::Connection, runtime: tokio::runtime::Handle) -> Self {
        Self {
            connection: Some(connection),
            runtime,
        }
    }

    /// A handle without a bus connection; method and service activations
    /// report failure. Used by tests.
    #[cfg(test)]
    pub fn disconnected(runtime: tokio::runtime::Handle) -> Self {
        Self {
            connection: None,
            runtime,
        }
    }

    /// Fire-and-forget method call on the session bus.
    pub fn call_method(&self, call: &MethodCall) -> bool {
        let Some(connection) = self.connection.clone() else {
            warn!("no bus connection for method call to '{}'", call.service);
            return false;
        };
        let MethodCall { service, path, interface, method } = call.clone();
        let context = format!("{} {} {}.{}", service, path, interface, method);
        self.runtime.spawn(async move {
            let result = connection
                .call_method(
                    Some(service.as_str()),
                    path,
                    Some(interface.as_str()),
                    method.as_str(),
                    &(),
                )
                .await;
            if let Err(e) = result {
                warn!("method call {} failed: {}", context, e);
            }
        });
        true
    }

    /// Tell a bound peer its shortcut fired.
    pub fn notify_activated(&self, service: &str, path: &OwnedObjectPath) -> bool {
        self.emit_to_peer(service, path, "Activated", ())
    }

    /// Tell a bound peer its shortcut was reassigned.
    pub fn notify_shortcut_changed(
        &self,
        service: &str,
        path: &OwnedObjectPath,
        old_shortcut: &str,
        new_shortcut: &str,
    ) -> bool {
        self.emit_to_peer(
            service,
            path,
            "ShortcutChanged",
            (old_shortcut.to_string(), new_shortcut.to_string()),
        )
    }

    fn emit_to_peer<B>(&self, service: &str, path: &OwnedObjectPath, member: &'static str, body: B) -> bool
    where
        B: zbus::zvariant::DynamicType + serde::Serialize + Send + Sync + 'static,
    {
        let Some(connection) = self.connection.clone() else {
            warn!("no bus connection to notify '{}'", service);
            return false;
        };
        let service = service.to_string();
        let path = path.clone();
        let context = format!("{} @ {}", service, path);
        self.runtime.spawn(async move {
            let result = connection
                .emit_signal(
                    Some(service.as_str()),
                    path,
                    CLIENT_INTERFACE,
                    member,
                    &body,
                )
                .await;
            if let Err(e) = result {
                debug!("cannot notify {}: {}", context, e);
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(p).unwrap()
    }

    #[tokio::test]
    async fn disabled_actions_never_activate() {
        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        let mut action = Action::new(
            ActionKind::Command {
                program: "/bin/true".into(),
                args: vec![],
            },
            "",
        );
        action.enabled = false;
        assert!(!action.activate(&bus));
    }

    #[tokio::test]
    async fn command_activation_reports_spawn_result() {
        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        let ok = Action::new(
            ActionKind::Command {
                program: "/bin/true".into(),
                args: vec![],
            },
            "",
        );
        let missing = Action::new(
            ActionKind::Command {
                program: "/nonexistent/hotkeyd-test-binary".into(),
                args: vec![],
            },
            "",
        );
        assert!(ok.activate(&bus));
        assert!(!missing.activate(&bus));
    }

    #[tokio::test]
    async fn inactive_service_binding_does_not_notify() {
        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        let action = Action::new(
            ActionKind::Service {
                service: ":1.42".into(),
                path: path("/lock"),
                persistent: false,
                active: false,
            },
            "",
        );
        assert!(!action.activate(&bus));
    }

    #[test]
    fn type_names() {
        let command = Action::new(
            ActionKind::Command {
                program: "x".into(),
                args: vec![],
            },
            "",
        );
        let method = Action::new(
            ActionKind::Method(MethodCall {
                service: "org.example".into(),
                path: path("/o"),
                interface: "org.example.I".into(),
                method: "M".into(),
            }),
            "",
        );
        let service = Action::new(
            ActionKind::Service {
                service: ":1.7".into(),
                path: path("/o"),
                persistent: true,
                active: true,
            },
            "",
        );
        assert_eq!(command.type_name(), "command");
        assert_eq!(method.type_name(), "method");
        assert_eq!(service.type_name(), "dbus");
    }
}
