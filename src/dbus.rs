//! The session-bus control surface.
//!
//! Two objects are exported under the well-known name: `/daemon` is the
//! administrative interface (enumerate, add, modify, remove, swap, policy,
//! interactive grab, quit) and `/native` the peer-oriented one, where the
//! calling connection manages its own service bindings. The name-owner
//! watcher that drives the service tracker also lives here.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task;
use tracing::{info, warn};
use zbus::message::Header;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

use crate::core::{ActionSummary, Core};
use crate::registry::MultipleActionsBehaviour;

pub const SERVICE_NAME: &str = "org.hotkeyd";
pub const DAEMON_PATH: &str = "/daemon";
pub const NATIVE_PATH: &str = "/native";

/// Wire form of a general action record.
type ActionRecord = (String, String, String, bool, String);

fn record(summary: ActionSummary) -> ActionRecord {
    (
        summary.shortcut,
        summary.kind,
        summary.description,
        summary.enabled,
        summary.details,
    )
}

/// Run a synchronous core operation off the bus executor.
async fn run_blocking<T, F>(core: Arc<Core>, op: F) -> T
where
    T: Default + Send + 'static,
    F: FnOnce(&Core) -> T + Send + 'static,
{
    match task::spawn_blocking(move || op(&core)).await {
        Ok(value) => value,
        Err(e) => {
            warn!("core operation panicked: {}", e);
            T::default()
        }
    }
}

fn sender_of(header: &Header<'_>) -> Option<String> {
    match header.sender() {
        Some(sender) => Some(sender.to_string()),
        None => {
            warn!("peer request without a sender");
            None
        }
    }
}

/// Change signals emitted on the `/daemon` object.
#[derive(Debug, Clone, Copy)]
enum Change {
    Added,
    Modified,
    ShortcutChanged,
    Removed,
}

async fn emit_change(connection: &Connection, change: Change, id: u64) {
    let emitter = match SignalEmitter::new(connection, DAEMON_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            warn!("cannot build signal emitter: {}", e);
            return;
        }
    };
    let result = match change {
        Change::Added => DaemonInterface::action_added(&emitter, id).await,
        Change::Modified => DaemonInterface::action_modified(&emitter, id).await,
        Change::ShortcutChanged => DaemonInterface::action_shortcut_changed(&emitter, id).await,
        Change::Removed => DaemonInterface::action_removed(&emitter, id).await,
    };
    if let Err(e) = result {
        warn!("cannot emit change signal: {}", e);
    }
}

pub struct DaemonInterface {
    core: Arc<Core>,
    connection: Connection,
}

#[zbus::interface(name = "org.hotkeyd.Daemon")]
impl DaemonInterface {
    async fn add_method_action(
        &self,
        shortcut: String,
        service: String,
        path: OwnedObjectPath,
        interface: String,
        method: String,
        description: String,
    ) -> (String, u64) {
        let result = run_blocking(self.core.clone(), move |core| {
            core.register_method(&shortcut, &service, &path, &interface, &method, &description)
        })
        .await;
        if result.1 != 0 {
            emit_change(&self.connection, Change::Added, result.1).await;
        }
        result
    }

    async fn add_command_action(
        &self,
        shortcut: String,
        command: String,
        arguments: Vec<String>,
        description: String,
    ) -> (String, u64) {
        let result = run_blocking(self.core.clone(), move |core| {
            core.register_command(&shortcut, &command, arguments, &description)
        })
        .await;
        if result.1 != 0 {
            emit_change(&self.connection, Change::Added, result.1).await;
        }
        result
    }

    async fn modify_action_description(&self, id: u64, description: String) -> bool {
        let done = run_blocking(self.core.clone(), move |core| {
            core.modify_description(id, &description)
        })
        .await;
        if done {
            emit_change(&self.connection, Change::Modified, id).await;
        }
        done
    }

    async fn modify_method_action(
        &self,
        id: u64,
        service: String,
        path: OwnedObjectPath,
        interface: String,
        method: String,
        description: String,
    ) -> bool {
        let done = run_blocking(self.core.clone(), move |core| {
            core.modify_method(id, &service, &path, &interface, &method, &description)
        })
        .await;
        if done {
            emit_change(&self.connection, Change::Modified, id).await;
        }
        done
    }

    async fn modify_command_action(
        &self,
        id: u64,
        command: String,
        arguments: Vec<String>,
        description: String,
    ) -> bool {
        let done = run_blocking(self.core.clone(), move |core| {
            core.modify_command(id, &command, arguments, &description)
        })
        .await;
        if done {
            emit_change(&self.connection, Change::Modified, id).await;
        }
        done
    }

    async fn change_shortcut(&self, id: u64, shortcut: String) -> String {
        let used = run_blocking(self.core.clone(), move |core| {
            core.change_shortcut(id, &shortcut)
        })
        .await;
        if !used.is_empty() {
            emit_change(&self.connection, Change::ShortcutChanged, id).await;
        }
        used
    }

    async fn swap_actions(&self, id1: u64, id2: u64) -> bool {
        let done = run_blocking(self.core.clone(), move |core| core.swap(id1, id2)).await;
        if done {
            emit_change(&self.connection, Change::Modified, id1).await;
            emit_change(&self.connection, Change::Modified, id2).await;
        }
        done
    }

    async fn remove_action(&self, id: u64) -> bool {
        let done = run_blocking(self.core.clone(), move |core| core.remove(id)).await;
        if done {
            emit_change(&self.connection, Change::Removed, id).await;
        }
        done
    }

    async fn set_multiple_actions_behaviour(&self, behaviour: u32) {
        let Some(behaviour) = MultipleActionsBehaviour::from_wire(behaviour) else {
            warn!("unknown multiple actions behaviour {}", behaviour);
            return;
        };
        run_blocking(self.core.clone(), move |core| {
            core.set_multiple_actions_behaviour(behaviour)
        })
        .await;
    }

    async fn get_multiple_actions_behaviour(&self) -> u32 {
        self.core.multiple_actions_behaviour().to_wire()
    }

    async fn get_all_action_ids(&self) -> Vec<u64> {
        self.core.all_action_ids()
    }

    async fn get_action_by_id(&self, id: u64) -> (bool, ActionRecord) {
        match self.core.action_info(id) {
            Some(summary) => (true, record(summary)),
            None => (false, ActionRecord::default()),
        }
    }

    async fn get_all_actions(&self) -> HashMap<u64, ActionRecord> {
        self.core
            .all_action_infos()
            .into_iter()
            .map(|(id, summary)| (id, record(summary)))
            .collect()
    }

    async fn get_dbus_action_info_by_id(&self, id: u64) -> (bool, (String, String, String)) {
        match self.core.service_action_info(id) {
            Some(info) => (true, (info.shortcut, info.service, info.path)),
            None => (false, Default::default()),
        }
    }

    async fn get_method_action_info_by_id(
        &self,
        id: u64,
    ) -> (bool, (String, String, String, String, String)) {
        match self.core.method_action_info(id) {
            Some(info) => (
                true,
                (info.shortcut, info.service, info.path, info.interface, info.method),
            ),
            None => (false, Default::default()),
        }
    }

    async fn get_command_action_info_by_id(
        &self,
        id: u64,
    ) -> (bool, (String, String, Vec<String>)) {
        match self.core.command_action_info(id) {
            Some(info) => (true, (info.shortcut, info.program, info.args)),
            None => (false, Default::default()),
        }
    }

    /// Capture the next key combination the user presses. The reply is
    /// delayed until the worker resolves the capture or the timeout fires.
    async fn grab_shortcut(&self, timeout: u32) -> (String, bool, bool, bool) {
        let outcome = self.core.clone().grab_shortcut(timeout).await;
        (
            outcome.shortcut,
            outcome.failed,
            outcome.cancelled,
            outcome.timed_out,
        )
    }

    async fn quit(&self) {
        info!("quit requested over the bus");
        self.core.request_quit();
    }

    #[zbus(signal)]
    async fn action_added(emitter: &SignalEmitter<'_>, id: u64) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn action_modified(emitter: &SignalEmitter<'_>, id: u64) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn action_shortcut_changed(emitter: &SignalEmitter<'_>, id: u64) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn action_removed(emitter: &SignalEmitter<'_>, id: u64) -> zbus::Result<()>;
}

pub struct NativeInterface {
    core: Arc<Core>,
    connection: Connection,
}

#[zbus::interface(name = "org.hotkeyd.Native")]
impl NativeInterface {
    async fn add_dbus_action(
        &self,
        shortcut: String,
        path: OwnedObjectPath,
        description: String,
        #[zbus(header)] header: Header<'_>,
    ) -> (String, u64) {
        let Some(sender) = sender_of(&header) else {
            return (String::new(), 0);
        };
        let result = run_blocking(self.core.clone(), move |core| {
            core.add_service_action(&shortcut, &path, &description, &sender)
        })
        .await;
        if result.1 != 0 {
            emit_change(&self.connection, Change::Added, result.1).await;
        }
        result
    }

    async fn modify_dbus_action(
        &self,
        path: OwnedObjectPath,
        description: String,
        #[zbus(header)] header: Header<'_>,
    ) -> u64 {
        let Some(sender) = sender_of(&header) else {
            return 0;
        };
        let id = run_blocking(self.core.clone(), move |core| {
            core.modify_service(&path, &description, &sender)
        })
        .await;
        if id != 0 {
            emit_change(&self.connection, Change::Modified, id).await;
        }
        id
    }

    async fn change_dbus_shortcut(
        &self,
        path: OwnedObjectPath,
        shortcut: String,
        #[zbus(header)] header: Header<'_>,
    ) -> (String, u64) {
        let Some(sender) = sender_of(&header) else {
            return (String::new(), 0);
        };
        let result = run_blocking(self.core.clone(), move |core| {
            core.change_service_shortcut(&path, &shortcut, &sender)
        })
        .await;
        if result.1 != 0 {
            emit_change(&self.connection, Change::ShortcutChanged, result.1).await;
        }
        result
    }

    async fn remove_dbus_action(
        &self,
        path: OwnedObjectPath,
        #[zbus(header)] header: Header<'_>,
    ) -> u64 {
        let Some(sender) = sender_of(&header) else {
            return 0;
        };
        let id = run_blocking(self.core.clone(), move |core| {
            core.remove_service(&path, &sender)
        })
        .await;
        if id != 0 {
            emit_change(&self.connection, Change::Removed, id).await;
        }
        id
    }
}

/// Export both objects on an already-named connection.
pub async fn serve(connection: &Connection, core: Arc<Core>) -> zbus::Result<()> {
    connection
        .object_server()
        .at(
            DAEMON_PATH,
            DaemonInterface {
                core: core.clone(),
                connection: connection.clone(),
            },
        )
        .await?;
    connection
        .object_server()
        .at(
            NATIVE_PATH,
            NativeInterface {
                core,
                connection: connection.clone(),
            },
        )
        .await?;
    info!("daemon objects exported at {} and {}", DAEMON_PATH, NATIVE_PATH);
    Ok(())
}

/// Feed `NameOwnerChanged` into the service tracker until the stream ends.
pub async fn watch_services(connection: Connection, core: Arc<Core>) {
    let proxy = match zbus::fdo::DBusProxy::new(&connection).await {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!("cannot watch bus names: {}", e);
            return;
        }
    };
    let mut stream = match proxy.receive_name_owner_changed().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("cannot subscribe to NameOwnerChanged: {}", e);
            return;
        }
    };
    info!("watching session bus names");

    while let Some(signal) = stream.next().await {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                warn!("malformed NameOwnerChanged: {}", e);
                continue;
            }
        };
        let name = args.name().to_string();
        let old_owner = args.old_owner().as_ref().map(|owner| owner.to_string());
        let new_owner = args.new_owner().as_ref().map(|owner| owner.to_string());

        if let Some(owner) = old_owner {
            let core = core.clone();
            let name = name.clone();
            let _ = task::spawn_blocking(move || core.service_disappeared(&name, &owner)).await;
        }
        if let Some(owner) = new_owner {
            let core = core.clone();
            let _ = task::spawn_blocking(move || core.service_appeared(&name, &owner)).await;
        }
    }
    warn!("NameOwnerChanged stream ended");
}
