//! The control core: every public registry operation, the service tracker
//! and the interactive grab session.
//!
//! Operations take effect under the single data lock and talk to the X11
//! worker through the backend while holding it, so the maps and the grab
//! set always move together. Pipe failures on the control channel are
//! fatal: the operation reports failure and orderly shutdown is requested.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use zbus::zvariant::OwnedObjectPath;

use crate::actions::{Action, ActionKind, BusHandle, MethodCall};
use crate::config;
use crate::keys;
use crate::pipe::PipeError;
use crate::registry::{GrabReply, MultipleActionsBehaviour, Registry, X11Shortcut};
use crate::worker::X11Backend;

/// Outcome of an interactive grab request, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabOutcome {
    pub shortcut: String,
    pub failed: bool,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl GrabOutcome {
    fn failed() -> Self {
        Self {
            shortcut: String::new(),
            failed: true,
            cancelled: false,
            timed_out: false,
        }
    }

    fn timed_out(failed: bool) -> Self {
        Self {
            shortcut: String::new(),
            failed,
            cancelled: false,
            timed_out: true,
        }
    }
}

/// Result of arming the grab state machine.
pub enum GrabStart {
    AlreadyGrabbing,
    BadTimeout,
    Failed,
    Started(oneshot::Receiver<GrabReply>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSummary {
    pub shortcut: String,
    pub kind: String,
    pub description: String,
    pub enabled: bool,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceActionInfo {
    pub shortcut: String,
    pub service: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodActionInfo {
    pub shortcut: String,
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandActionInfo {
    pub shortcut: String,
    pub program: String,
    pub args: Vec<String>,
}

pub struct Core {
    pub data: Arc<Mutex<Registry>>,
    backend: Arc<dyn X11Backend>,
    bus: BusHandle,
    save_target: PathBuf,
    log_level_entry: Option<String>,
    save_allowed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Core {
    pub fn new(
        data: Arc<Mutex<Registry>>,
        backend: Arc<dyn X11Backend>,
        bus: BusHandle,
        save_target: PathBuf,
        log_level_entry: Option<String>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            data,
            backend,
            bus,
            save_target,
            log_level_entry,
            save_allowed: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Enable persistence once the initial configuration load is done.
    pub fn allow_saving(&self) {
        self.save_allowed.store(true, Ordering::Release);
    }

    /// Ask the main loop to shut the daemon down.
    pub fn request_quit(&self) {
        let _ = self.shutdown.send(true);
    }

    fn channel_failed(&self, error: PipeError) {
        error!("X11 control channel failed: {}", error);
        self.request_quit();
    }

    fn save_config(&self, data: &Registry) {
        if !self.save_allowed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = config::save(&self.save_target, self.log_level_entry.as_deref(), data) {
            warn!(
                "cannot save configuration to {}: {}",
                self.save_target.display(),
                e
            );
        }
    }

    // ---- shortcut translation -------------------------------------------

    fn remote_string_to_keycode(&self, name: &str) -> Option<u8> {
        match self.backend.string_to_keycode(name) {
            Ok(keycode) => Some(keycode),
            Err(e) => {
                self.channel_failed(e);
                None
            }
        }
    }

    /// Split on `+`, resolve the modifier tokens and the final key segment.
    fn shortcut_to_x11(&self, shortcut: &str) -> Option<X11Shortcut> {
        let parts: Vec<&str> = shortcut.split('+').collect();
        let (key, modifiers) = parts.split_last()?;
        let mut mask = 0u32;
        for token in modifiers {
            mask |= keys::modifier_mask(token)?;
        }
        if key.is_empty() {
            return None;
        }
        let keycode = self.remote_string_to_keycode(key)?;
        if keycode == 0 {
            return None;
        }
        Some((keycode, mask))
    }

    /// Canonical string for an X11 binding; modifiers in fixed order, key
    /// name from the worker. Fails when the keysym has no name.
    fn x11_to_shortcut(&self, binding: X11Shortcut) -> Option<String> {
        let key = match self.backend.keycode_to_string(binding.0) {
            Ok(key) => key,
            Err(e) => {
                self.channel_failed(e);
                return None;
            }
        };
        if key.is_empty() {
            return None;
        }
        Some(keys::compose_shortcut(binding.1, &key))
    }

    /// Resolve and canonicalize an incoming shortcut, remembering the
    /// association in both directions.
    fn add_action_common(
        &self,
        data: &mut Registry,
        shortcut: &str,
    ) -> Option<(X11Shortcut, String)> {
        let Some(binding) = self.shortcut_to_x11(shortcut) else {
            warn!(
                "cannot extract keycode and modifiers from shortcut '{}'",
                shortcut
            );
            return None;
        };

        let used = match data.shortcut_by_x11.get(&binding) {
            Some(existing) => existing.clone(),
            None => {
                let Some(canonical) = self.x11_to_shortcut(binding) else {
                    warn!("cannot get back shortcut '{}'", shortcut);
                    return None;
                };
                data.shortcut_by_x11.insert(binding, canonical.clone());
                canonical
            }
        };

        if shortcut != used {
            info!("using shortcut '{}' instead of '{}'", used, shortcut);
        }

        data.x11_by_shortcut.entry(used.clone()).or_insert(binding);
        Some((binding, used))
    }

    /// Install the X11 grab unless another binding already holds it.
    fn grab_or_reuse(&self, data: &Registry, binding: X11Shortcut, shortcut: &str) -> Option<()> {
        if data
            .ids_by_shortcut
            .get(shortcut)
            .is_some_and(|ids| !ids.is_empty())
        {
            return Some(());
        }
        match self.backend.grab_key(binding) {
            Ok(true) => Some(()),
            Ok(false) => {
                warn!("cannot grab shortcut '{}'", shortcut);
                None
            }
            Err(e) => {
                self.channel_failed(e);
                None
            }
        }
    }

    /// Release the grab backing `shortcut`.
    fn release_grab(&self, data: &Registry, shortcut: &str) {
        let Some(&binding) = data.x11_by_shortcut.get(shortcut) else {
            return;
        };
        match self.backend.ungrab_key(binding) {
            Ok(true) => {}
            Ok(false) => warn!("cannot ungrab shortcut '{}'", shortcut),
            Err(e) => self.channel_failed(e),
        }
    }

    // ---- registration ---------------------------------------------------

    pub fn register_command(
        &self,
        shortcut: &str,
        program: &str,
        args: Vec<String>,
        description: &str,
    ) -> (String, u64) {
        info!(
            "add command action: shortcut '{}' program '{}'",
            shortcut, program
        );
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);

        let Some((binding, used)) = self.add_action_common(&mut data, shortcut) else {
            return (String::new(), 0);
        };
        if self.grab_or_reuse(&data, binding, &used).is_none() {
            return (String::new(), 0);
        }

        let id = data.next_id();
        data.bind(
            id,
            used.clone(),
            Action::new(
                ActionKind::Command {
                    program: program.to_string(),
                    args,
                },
                description,
            ),
        );
        info!("command action '{}' registered as #{}", used, id);
        self.save_config(&data);
        (used, id)
    }

    pub fn register_method(
        &self,
        shortcut: &str,
        service: &str,
        path: &OwnedObjectPath,
        interface: &str,
        method: &str,
        description: &str,
    ) -> (String, u64) {
        info!(
            "add method action: shortcut '{}' target {} {} {}.{}",
            shortcut, service, path, interface, method
        );
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);

        let Some((binding, used)) = self.add_action_common(&mut data, shortcut) else {
            return (String::new(), 0);
        };
        if self.grab_or_reuse(&data, binding, &used).is_none() {
            return (String::new(), 0);
        }

        let id = data.next_id();
        data.bind(
            id,
            used.clone(),
            Action::new(
                ActionKind::Method(MethodCall {
                    service: service.to_string(),
                    path: path.clone(),
                    interface: interface.to_string(),
                    method: method.to_string(),
                }),
                description,
            ),
        );
        info!("method action '{}' registered as #{}", used, id);
        self.save_config(&data);
        (used, id)
    }

    fn add_or_register_service(
        &self,
        data: &mut Registry,
        shortcut: &str,
        client_name: &str,
        display_service: String,
        path: &OwnedObjectPath,
        description: &str,
        persistent: bool,
        active: bool,
    ) -> (String, u64) {
        if data
            .paths_by_service
            .get(client_name)
            .is_some_and(|paths| paths.contains(path))
        {
            // Hand the existing binding back rather than failing outright.
            warn!(
                "service client already registered for '{}' @ {}",
                client_name, path
            );
            let client = (client_name.to_string(), path.clone());
            return match data.id_by_service_client.get(&client) {
                Some(&id) => match data.shortcut_and_action_by_id.get(&id) {
                    Some((existing, _)) => (existing.clone(), id),
                    None => (String::new(), 0),
                },
                None => (String::new(), 0),
            };
        }

        let Some((binding, used)) = self.add_action_common(data, shortcut) else {
            return (String::new(), 0);
        };
        if self.grab_or_reuse(data, binding, &used).is_none() {
            return (String::new(), 0);
        }

        let id = data.next_id();
        data.track_service_client(client_name, path, id);
        data.bind(
            id,
            used.clone(),
            Action::new(
                ActionKind::Service {
                    service: display_service,
                    path: path.clone(),
                    persistent,
                    active,
                },
                description,
            ),
        );
        info!("service action '{}' registered as #{}", used, id);
        (used, id)
    }

    /// Register a transient service binding on behalf of the calling peer.
    pub fn add_service_action(
        &self,
        shortcut: &str,
        path: &OwnedObjectPath,
        description: &str,
        sender: &str,
    ) -> (String, u64) {
        info!(
            "add service action: shortcut '{}' path {} sender '{}'",
            shortcut, path, sender
        );
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        let display = data.preferred_service_name(sender).to_string();
        self.add_or_register_service(&mut data, shortcut, sender, display, path, description, false, true)
    }

    /// Persistent variant used while loading the configuration file.
    pub fn register_service_action(
        &self,
        shortcut: &str,
        service: &str,
        path: &OwnedObjectPath,
        description: &str,
    ) -> u64 {
        info!(
            "register service action: shortcut '{}' service '{}' path {}",
            shortcut, service, path
        );
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        self.add_or_register_service(
            &mut data,
            shortcut,
            service,
            service.to_string(),
            path,
            description,
            true,
            false,
        )
        .1
    }

    // ---- modification ---------------------------------------------------

    pub fn modify_description(&self, id: u64, description: &str) -> bool {
        info!("modify description of action #{}", id);
        let mut data = self.data.lock();
        let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&id) else {
            warn!("no action registered with id #{}", id);
            return false;
        };
        if matches!(action.kind, ActionKind::Service { .. }) {
            warn!("cannot modify the description of a service action by id");
            return false;
        }
        action.description = description.to_string();
        self.save_config(&data);
        true
    }

    pub fn modify_method(
        &self,
        id: u64,
        service: &str,
        path: &OwnedObjectPath,
        interface: &str,
        method: &str,
        description: &str,
    ) -> bool {
        info!("modify method action #{}", id);
        let mut data = self.data.lock();
        let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&id) else {
            warn!("no action registered with id #{}", id);
            return false;
        };
        if !matches!(action.kind, ActionKind::Method(_)) {
            warn!(
                "action #{} is of type '{}', not 'method'",
                id,
                action.type_name()
            );
            return false;
        }
        *action = Action::new(
            ActionKind::Method(MethodCall {
                service: service.to_string(),
                path: path.clone(),
                interface: interface.to_string(),
                method: method.to_string(),
            }),
            description,
        );
        self.save_config(&data);
        true
    }

    pub fn modify_command(
        &self,
        id: u64,
        program: &str,
        args: Vec<String>,
        description: &str,
    ) -> bool {
        info!("modify command action #{}", id);
        let mut data = self.data.lock();
        let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&id) else {
            warn!("no action registered with id #{}", id);
            return false;
        };
        if !matches!(action.kind, ActionKind::Command { .. }) {
            warn!(
                "action #{} is of type '{}', not 'command'",
                id,
                action.type_name()
            );
            return false;
        }
        *action = Action::new(
            ActionKind::Command {
                program: program.to_string(),
                args,
            },
            description,
        );
        self.save_config(&data);
        true
    }

    /// Update the description of the sender's binding at `path`.
    pub fn modify_service(&self, path: &OwnedObjectPath, description: &str, sender: &str) -> u64 {
        info!("modify service action: path {} sender '{}'", path, sender);
        let mut data = self.data.lock();
        let client = (sender.to_string(), path.clone());
        let Some(&id) = data.id_by_service_client.get(&client) else {
            warn!("no action registered for '{}' @ {}", sender, path);
            return 0;
        };
        if let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&id) {
            action.description = description.to_string();
        }
        id
    }

    /// Reassign an action to a new shortcut. Returns the canonical form,
    /// empty on failure. A reassignment to the same canonical form leaves
    /// the grabs untouched.
    pub fn change_shortcut(&self, id: u64, shortcut: &str) -> String {
        info!("change shortcut of action #{} to '{}'", id, shortcut);
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        if !data.shortcut_and_action_by_id.contains_key(&id) {
            warn!("no action registered with id #{}", id);
            return String::new();
        }
        self.change_shortcut_locked(&mut data, id, shortcut)
            .map(|used| {
                self.save_config(&data);
                used
            })
            .unwrap_or_default()
    }

    /// Reassign the sender's service binding at `path`; the peer is told
    /// about the change.
    pub fn change_service_shortcut(
        &self,
        path: &OwnedObjectPath,
        shortcut: &str,
        sender: &str,
    ) -> (String, u64) {
        info!(
            "change service shortcut: path {} to '{}' sender '{}'",
            path, shortcut, sender
        );
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        let client = (sender.to_string(), path.clone());
        let Some(&id) = data.id_by_service_client.get(&client) else {
            warn!("no action registered for '{}' @ {}", sender, path);
            return (String::new(), 0);
        };
        match self.change_shortcut_locked(&mut data, id, shortcut) {
            Some(used) => (used, id),
            None => (String::new(), 0),
        }
    }

    fn change_shortcut_locked(
        &self,
        data: &mut Registry,
        id: u64,
        shortcut: &str,
    ) -> Option<String> {
        let Some((binding, used)) = self.add_action_common(data, shortcut) else {
            return None;
        };
        let old_shortcut = data.shortcut_and_action_by_id.get(&id)?.0.clone();

        if old_shortcut != used {
            self.grab_or_reuse(data, binding, &used)?;
            if data.unbind_from_shortcut(&old_shortcut, id) {
                self.release_grab(data, &old_shortcut);
            }
            data.ids_by_shortcut
                .entry(used.clone())
                .or_default()
                .insert(id);
            if let Some(entry) = data.shortcut_and_action_by_id.get_mut(&id) {
                entry.0 = used.clone();
                if let ActionKind::Service { service, path, .. } = &entry.1.kind {
                    self.bus
                        .notify_shortcut_changed(service, path, &old_shortcut, &used);
                }
            }
        }
        Some(used)
    }

    /// Exchange the actions of two bindings sharing one shortcut.
    pub fn swap(&self, id1: u64, id2: u64) -> bool {
        info!("swap actions #{} and #{}", id1, id2);
        let mut data = self.data.lock();
        let Some((shortcut1, action1)) = data.shortcut_and_action_by_id.get(&id1).cloned() else {
            warn!("no action registered with id #{}", id1);
            return false;
        };
        let Some((shortcut2, action2)) = data.shortcut_and_action_by_id.get(&id2).cloned() else {
            warn!("no action registered with id #{}", id2);
            return false;
        };
        if shortcut1 != shortcut2 {
            warn!("cannot swap actions assigned to different shortcuts");
            return false;
        }
        data.shortcut_and_action_by_id
            .insert(id1, (shortcut1, action2));
        data.shortcut_and_action_by_id
            .insert(id2, (shortcut2, action1));
        self.save_config(&data);
        true
    }

    // ---- removal --------------------------------------------------------

    pub fn remove(&self, id: u64) -> bool {
        info!("remove action #{}", id);
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        let Some((shortcut, action)) = data.shortcut_and_action_by_id.get(&id) else {
            warn!("no action registered with id #{}", id);
            return false;
        };
        if matches!(action.kind, ActionKind::Service { .. }) {
            warn!("cannot remove a service action by id");
            return false;
        }
        let shortcut = shortcut.clone();
        data.shortcut_and_action_by_id.remove(&id);
        if data.unbind_from_shortcut(&shortcut, id) {
            self.release_grab(&data, &shortcut);
        }
        self.save_config(&data);
        true
    }

    pub fn remove_service(&self, path: &OwnedObjectPath, sender: &str) -> u64 {
        info!("remove service action: path {} sender '{}'", path, sender);
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        let client = (sender.to_string(), path.clone());
        let Some(&id) = data.id_by_service_client.get(&client) else {
            warn!("no action registered for '{}' @ {}", sender, path);
            return 0;
        };
        let Some((shortcut, _)) = data.shortcut_and_action_by_id.remove(&id) else {
            return 0;
        };
        data.untrack_service_client(sender, path);
        if data.unbind_from_shortcut(&shortcut, id) {
            self.release_grab(&data, &shortcut);
        }
        id
    }

    // ---- queries --------------------------------------------------------

    pub fn set_multiple_actions_behaviour(&self, behaviour: MultipleActionsBehaviour) {
        info!("multiple actions behaviour set to '{}'", behaviour.as_str());
        let mut data = self.data.lock();
        data.multiple_actions_behaviour = behaviour;
        self.save_config(&data);
    }

    pub fn multiple_actions_behaviour(&self) -> MultipleActionsBehaviour {
        self.data.lock().multiple_actions_behaviour
    }

    pub fn all_action_ids(&self) -> Vec<u64> {
        self.data.lock().shortcut_and_action_by_id.keys().copied().collect()
    }

    pub fn action_info(&self, id: u64) -> Option<ActionSummary> {
        let data = self.data.lock();
        match data.shortcut_and_action_by_id.get(&id) {
            Some((shortcut, action)) => Some(summarize(&data, shortcut, action)),
            None => {
                warn!("no action registered with id #{}", id);
                None
            }
        }
    }

    pub fn all_action_infos(&self) -> Vec<(u64, ActionSummary)> {
        let data = self.data.lock();
        data.shortcut_and_action_by_id
            .iter()
            .map(|(id, (shortcut, action))| (*id, summarize(&data, shortcut, action)))
            .collect()
    }

    pub fn service_action_info(&self, id: u64) -> Option<ServiceActionInfo> {
        let data = self.data.lock();
        let Some((shortcut, action)) = data.shortcut_and_action_by_id.get(&id) else {
            warn!("no action registered with id #{}", id);
            return None;
        };
        let ActionKind::Service { service, path, .. } = &action.kind else {
            warn!(
                "action #{} is of type '{}', not 'dbus'",
                id,
                action.type_name()
            );
            return None;
        };
        Some(ServiceActionInfo {
            shortcut: shortcut.clone(),
            service: data.preferred_service_name(service).to_string(),
            path: path.to_string(),
        })
    }

    pub fn method_action_info(&self, id: u64) -> Option<MethodActionInfo> {
        let data = self.data.lock();
        let Some((shortcut, action)) = data.shortcut_and_action_by_id.get(&id) else {
            warn!("no action registered with id #{}", id);
            return None;
        };
        let ActionKind::Method(call) = &action.kind else {
            warn!(
                "action #{} is of type '{}', not 'method'",
                id,
                action.type_name()
            );
            return None;
        };
        Some(MethodActionInfo {
            shortcut: shortcut.clone(),
            service: call.service.clone(),
            path: call.path.to_string(),
            interface: call.interface.clone(),
            method: call.method.clone(),
        })
    }

    pub fn command_action_info(&self, id: u64) -> Option<CommandActionInfo> {
        let data = self.data.lock();
        let Some((shortcut, action)) = data.shortcut_and_action_by_id.get(&id) else {
            warn!("no action registered with id #{}", id);
            return None;
        };
        let ActionKind::Command { program, args } = &action.kind else {
            warn!(
                "action #{} is of type '{}', not 'command'",
                id,
                action.type_name()
            );
            return None;
        };
        Some(CommandActionInfo {
            shortcut: shortcut.clone(),
            program: program.clone(),
            args: args.clone(),
        })
    }

    // ---- service tracker ------------------------------------------------

    /// A bus name gained an owner. Unique-name-only appearances carry no
    /// alias information and are ignored.
    pub fn service_appeared(&self, service: &str, owner: &str) {
        debug!("service '{}' appeared as '{}'", service, owner);
        let mut data = self.data.lock();
        if service == owner {
            return;
        }
        data.service_names_by_id
            .entry(owner.to_string())
            .or_default()
            .insert(service.to_string());
        data.preferred_name_by_id
            .entry(owner.to_string())
            .or_insert_with(|| service.to_string());
        data.service_id_by_name
            .insert(service.to_string(), owner.to_string());

        // Peer registrations are keyed by the owner's unique name,
        // configured persistent ones by the well-known name.
        for key in [owner, service] {
            let Some(paths) = data.paths_by_service.get(key).cloned() else {
                continue;
            };
            for path in paths {
                let Some(&id) = data.id_by_service_client.get(&(key.to_string(), path.clone()))
                else {
                    continue;
                };
                if let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&id) {
                    if let ActionKind::Service { active, .. } = &mut action.kind {
                        if !*active {
                            info!("activating service action #{} for '{}' @ {}", id, service, path);
                            *active = true;
                        }
                    }
                }
            }
        }
    }

    /// A bus name lost its owner. When the unique name itself dies, the
    /// transient bindings of that peer are removed and their grabs
    /// released; persistent bindings are merely deactivated.
    pub fn service_disappeared(&self, service: &str, owner: &str) {
        debug!("service '{}' disappeared from '{}'", service, owner);
        let mut data = self.data.lock();
        let owner_gone = service == owner;

        let mut keys = vec![owner];
        if !owner_gone {
            keys.push(service);
        }
        for key in keys {
            let Some(paths) = data.paths_by_service.get(key).cloned() else {
                continue;
            };
            for path in paths {
                let client = (key.to_string(), path.clone());
                let Some(&id) = data.id_by_service_client.get(&client) else {
                    continue;
                };
                let transient = matches!(
                    data.shortcut_and_action_by_id.get(&id),
                    Some((_, action))
                        if matches!(action.kind, ActionKind::Service { persistent: false, .. })
                );
                if owner_gone && transient {
                    info!("removing service action #{} for '{}' @ {}", id, service, path);
                    let removed = data.shortcut_and_action_by_id.remove(&id);
                    data.untrack_service_client(key, &path);
                    if let Some((shortcut, _)) = removed {
                        if data.unbind_from_shortcut(&shortcut, id) {
                            self.release_grab(&data, &shortcut);
                        }
                    }
                } else if let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&id) {
                    if let ActionKind::Service { active, .. } = &mut action.kind {
                        if *active {
                            info!(
                                "deactivating service action #{} for '{}' @ {}",
                                id, service, path
                            );
                            *active = false;
                        }
                    }
                }
            }
        }

        if owner_gone {
            data.preferred_name_by_id.remove(owner);
            if let Some(aliases) = data.service_names_by_id.remove(owner) {
                for alias in aliases {
                    data.service_id_by_name.remove(&alias);
                }
            }
        } else {
            if let Some(names) = data.service_names_by_id.get_mut(owner) {
                names.remove(service);
                if names.is_empty() {
                    data.service_names_by_id.remove(owner);
                }
            }
            if data
                .preferred_name_by_id
                .get(owner)
                .is_some_and(|preferred| preferred == service)
            {
                data.preferred_name_by_id.remove(owner);
            }
            data.service_id_by_name.remove(service);
        }
    }

    // ---- interactive grab -----------------------------------------------

    /// Arm the grab state machine. The caller awaits the returned receiver
    /// for the worker-side resolution.
    pub fn begin_grab(&self, timeout_ms: u32) -> GrabStart {
        info!("grab shortcut requested, timeout {} ms", timeout_ms);
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        if data.grab_session.requested {
            debug!("grab shortcut rejected: already grabbing");
            return GrabStart::AlreadyGrabbing;
        }
        if !(1000..=60000).contains(&timeout_ms) {
            debug!("grab shortcut rejected: timeout out of range");
            return GrabStart::BadTimeout;
        }
        match self.backend.grab_keyboard() {
            Ok(true) => {}
            Ok(false) => return GrabStart::Failed,
            Err(e) => {
                self.channel_failed(e);
                return GrabStart::Failed;
            }
        }
        let (tx, rx) = oneshot::channel();
        data.grab_session.requested = true;
        data.grab_session.pending = Some(tx);
        debug!("grab shortcut armed");
        GrabStart::Started(rx)
    }

    /// Worker signalled that it wrote a grab resolution onto the Response
    /// pipe.
    pub fn handle_grab_resolved(&self) {
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
    }

    /// Consume a pending grab resolution. Also called at the top of every
    /// operation that performs a worker round-trip, so the payload can
    /// never be mistaken for a command reply.
    fn drain_grab_payload(&self, data: &mut Registry) {
        if !data.grab_payload_pending {
            return;
        }
        data.grab_payload_pending = false;
        match self.backend.read_grab_payload() {
            Ok(reply) => {
                data.grab_session.requested = false;
                if let Some(tx) = data.grab_session.pending.take() {
                    let _ = tx.send(reply);
                }
            }
            Err(e) => self.channel_failed(e),
        }
    }

    /// Timer expiry: release the keyboard and report whether the server
    /// rejected the release. No-op when a resolution won the race.
    pub fn grab_timed_out(&self) -> bool {
        info!("grab shortcut timed out");
        let mut data = self.data.lock();
        self.drain_grab_payload(&mut data);
        if data.grab_session.pending.take().is_none() {
            data.grab_session.requested = false;
            return false;
        }
        data.grab_session.requested = false;
        match self.backend.ungrab_keyboard() {
            Ok(ok) => !ok,
            Err(e) => {
                self.channel_failed(e);
                true
            }
        }
    }

    /// The full interactive grab: arm, await the worker resolution, time
    /// out after `timeout_ms`.
    pub async fn grab_shortcut(self: Arc<Self>, timeout_ms: u32) -> GrabOutcome {
        let core = self.clone();
        let start = match tokio::task::spawn_blocking(move || core.begin_grab(timeout_ms)).await {
            Ok(start) => start,
            Err(_) => return GrabOutcome::failed(),
        };
        let rx = match start {
            GrabStart::AlreadyGrabbing | GrabStart::Failed => return GrabOutcome::failed(),
            GrabStart::BadTimeout => return GrabOutcome::timed_out(false),
            GrabStart::Started(rx) => rx,
        };

        match tokio::time::timeout(Duration::from_millis(u64::from(timeout_ms)), rx).await {
            Ok(Ok(reply)) => GrabOutcome {
                shortcut: reply.shortcut,
                failed: false,
                cancelled: reply.cancelled,
                timed_out: false,
            },
            // The sender is dropped only on shutdown.
            Ok(Err(_)) => GrabOutcome::failed(),
            Err(_) => {
                let core = self.clone();
                let failed = tokio::task::spawn_blocking(move || core.grab_timed_out())
                    .await
                    .unwrap_or(true);
                GrabOutcome::timed_out(failed)
            }
        }
    }

    // ---- configuration --------------------------------------------------

    /// Register every binding loaded from the configuration files.
    pub fn load_bindings(&self, bindings: Vec<config::Binding>) {
        for binding in bindings {
            let id = match &binding.action {
                config::BindingAction::Command { program, args } => {
                    self.register_command(&binding.shortcut, program, args.clone(), &binding.description)
                        .1
                }
                config::BindingAction::Method {
                    service,
                    path,
                    interface,
                    method,
                } => {
                    self.register_method(
                        &binding.shortcut,
                        service,
                        path,
                        interface,
                        method,
                        &binding.description,
                    )
                    .1
                }
                config::BindingAction::Service { service, path } => {
                    self.register_service_action(&binding.shortcut, service, path, &binding.description)
                }
            };
            if id != 0 && !binding.enabled {
                let mut data = self.data.lock();
                if let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&id) {
                    action.enabled = false;
                }
            }
        }
    }
}

fn summarize(data: &Registry, shortcut: &str, action: &Action) -> ActionSummary {
    let details = match &action.kind {
        ActionKind::Command { program, args } => {
            let all: Vec<&str> = std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .collect();
            format!("\"{}\"", all.join("\" \""))
        }
        ActionKind::Method(call) => format!(
            "{} {} {} {}",
            call.service, call.path, call.interface, call.method
        ),
        ActionKind::Service { service, path, .. } => {
            format!("{} {}", data.preferred_service_name(service), path)
        }
    };
    ActionSummary {
        shortcut: shortcut.to_string(),
        kind: action.type_name().to_string(),
        description: action.description.clone(),
        enabled: action.enabled,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ALT_MASK, CONTROL_MASK, META_MASK};
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex as StdMutex;

    /// US-ish keymap fragment plus a recorded grab set, standing in for
    /// the worker thread.
    struct FakeBackend {
        grabbed: StdMutex<HashSet<X11Shortcut>>,
        grab_events: StdMutex<Vec<(X11Shortcut, bool)>>,
        keyboard_grabbed: StdMutex<bool>,
        payloads: StdMutex<VecDeque<GrabReply>>,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                grabbed: StdMutex::new(HashSet::new()),
                grab_events: StdMutex::new(Vec::new()),
                keyboard_grabbed: StdMutex::new(false),
                payloads: StdMutex::new(VecDeque::new()),
            })
        }

        fn grabbed_set(&self) -> HashSet<X11Shortcut> {
            self.grabbed.lock().unwrap().clone()
        }

        fn grab_event_count(&self) -> usize {
            self.grab_events.lock().unwrap().len()
        }

        fn queue_payload(&self, reply: GrabReply) {
            self.payloads.lock().unwrap().push_back(reply);
        }

        fn keymap(name: &str) -> u8 {
            match name {
                "T" | "t" => 28,
                "X" | "x" => 53,
                "L" | "l" => 46,
                "F1" => 67,
                "space" => 65,
                _ => 0,
            }
        }

        fn key_name(keycode: u8) -> &'static str {
            match keycode {
                28 => "T",
                53 => "X",
                46 => "L",
                67 => "F1",
                65 => "space",
                _ => "",
            }
        }
    }

    impl X11Backend for FakeBackend {
        fn string_to_keycode(&self, name: &str) -> Result<u8, PipeError> {
            Ok(Self::keymap(name))
        }

        fn keycode_to_string(&self, keycode: u8) -> Result<String, PipeError> {
            Ok(Self::key_name(keycode).to_string())
        }

        fn grab_key(&self, binding: X11Shortcut) -> Result<bool, PipeError> {
            self.grabbed.lock().unwrap().insert(binding);
            self.grab_events.lock().unwrap().push((binding, true));
            Ok(true)
        }

        fn ungrab_key(&self, binding: X11Shortcut) -> Result<bool, PipeError> {
            self.grabbed.lock().unwrap().remove(&binding);
            self.grab_events.lock().unwrap().push((binding, false));
            Ok(true)
        }

        fn grab_keyboard(&self) -> Result<bool, PipeError> {
            *self.keyboard_grabbed.lock().unwrap() = true;
            Ok(true)
        }

        fn ungrab_keyboard(&self) -> Result<bool, PipeError> {
            *self.keyboard_grabbed.lock().unwrap() = false;
            Ok(true)
        }

        fn read_grab_payload(&self) -> Result<GrabReply, PipeError> {
            Ok(self
                .payloads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(GrabReply {
                    shortcut: String::new(),
                    cancelled: true,
                }))
        }

        fn wake(&self) {}
    }

    fn test_core(backend: Arc<FakeBackend>, dir: &std::path::Path) -> Arc<Core> {
        let data = Arc::new(Mutex::new(Registry::new(
            MultipleActionsBehaviour::First,
            crate::keys::AllowMasks::default(),
        )));
        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Core::new(
            data,
            backend,
            bus,
            dir.join("global_actions.ini"),
            None,
            shutdown,
        ))
    }

    fn object_path(p: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(p).unwrap()
    }

    #[tokio::test]
    async fn register_command_grabs_and_reports_canonical_form() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let (shortcut, id) =
            core.register_command("Control+Alt+T", "/usr/bin/xterm", vec![], "terminal");
        assert_eq!(shortcut, "Control+Alt+T");
        assert_eq!(id, 1);
        assert_eq!(
            backend.grabbed_set(),
            HashSet::from([(28, CONTROL_MASK | ALT_MASK)])
        );

        let info = core.action_info(1).unwrap();
        assert_eq!(info.kind, "command");
        assert_eq!(info.shortcut, "Control+Alt+T");
        assert_eq!(info.description, "terminal");
        assert!(info.enabled);
        assert_eq!(core.all_action_ids(), vec![1]);
    }

    #[tokio::test]
    async fn canonicalization_fixes_modifier_order() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(FakeBackend::new(), dir.path());

        let (shortcut, id) = core.register_method(
            "Alt+Control+F1",
            "org.example",
            &object_path("/obj"),
            "org.example.Iface",
            "Run",
            "",
        );
        assert_eq!(shortcut, "Control+Alt+F1");
        assert_ne!(id, 0);

        // Idempotence: re-canonicalizing the canonical form changes nothing.
        let reassigned = core.change_shortcut(id, "Control+Alt+F1");
        assert_eq!(reassigned, "Control+Alt+F1");
    }

    #[tokio::test]
    async fn unknown_modifier_and_unresolvable_key_fail_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        assert_eq!(
            core.register_command("Hyper+T", "/bin/true", vec![], ""),
            (String::new(), 0)
        );
        assert_eq!(
            core.register_command("Control+NoSuchKey", "/bin/true", vec![], ""),
            (String::new(), 0)
        );
        assert!(backend.grabbed_set().is_empty());
        assert!(core.all_action_ids().is_empty());
    }

    #[tokio::test]
    async fn shared_shortcut_grabs_once_and_releases_with_the_last_binding() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let (_, first) = core.register_command("Meta+X", "/bin/true", vec![], "");
        let (_, second) = core.register_command("Meta+X", "/bin/false", vec![], "");
        assert!(second > first);
        assert_eq!(backend.grab_event_count(), 1);

        assert!(core.remove(first));
        assert_eq!(backend.grabbed_set(), HashSet::from([(53, META_MASK)]));
        assert!(core.remove(second));
        assert!(backend.grabbed_set().is_empty());

        // Ids are never reused.
        let (_, third) = core.register_command("Meta+X", "/bin/true", vec![], "");
        assert!(third > second);
    }

    #[tokio::test]
    async fn modify_checks_the_action_type() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(FakeBackend::new(), dir.path());

        let (_, command_id) = core.register_command("Meta+X", "/bin/true", vec![], "");
        let (_, method_id) = core.register_method(
            "Control+Alt+T",
            "org.example",
            &object_path("/obj"),
            "org.example.Iface",
            "Run",
            "",
        );
        let (_, service_id) =
            core.add_service_action("Meta+L", &object_path("/lock"), "", ":1.42");

        assert!(!core.modify_method(
            command_id,
            "org.example",
            &object_path("/obj"),
            "i",
            "m",
            ""
        ));
        assert!(!core.modify_command(method_id, "/bin/true", vec![], ""));
        assert!(!core.modify_description(service_id, "nope"));
        assert!(!core.remove(service_id));
        assert!(!core.modify_command(9999, "/bin/true", vec![], ""));

        assert!(core.modify_command(command_id, "/bin/echo", vec!["hi".into()], "echo"));
        let info = core.command_action_info(command_id).unwrap();
        assert_eq!(info.program, "/bin/echo");
        assert_eq!(info.args, vec!["hi"]);
        assert!(core.modify_description(command_id, "changed"));
        assert_eq!(core.action_info(command_id).unwrap().description, "changed");
    }

    #[tokio::test]
    async fn change_shortcut_to_equivalent_form_leaves_grabs_alone() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let (_, id) = core.register_command("Control+Alt+T", "/bin/true", vec![], "");
        let events_before = backend.grab_event_count();

        assert_eq!(core.change_shortcut(id, "Alt+Control+T"), "Control+Alt+T");
        assert_eq!(backend.grab_event_count(), events_before);
    }

    #[tokio::test]
    async fn change_shortcut_moves_the_grab() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let (_, id) = core.register_command("Control+Alt+T", "/bin/true", vec![], "");
        assert_eq!(core.change_shortcut(id, "Meta+X"), "Meta+X");
        assert_eq!(backend.grabbed_set(), HashSet::from([(53, META_MASK)]));
        assert_eq!(core.action_info(id).unwrap().shortcut, "Meta+X");
    }

    #[tokio::test]
    async fn swap_requires_a_shared_shortcut_and_is_an_involution() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(FakeBackend::new(), dir.path());

        let (_, a) = core.register_command("Meta+X", "/bin/true", vec![], "a");
        let (_, b) = core.register_command("Meta+X", "/bin/false", vec![], "b");
        let (_, other) = core.register_command("Meta+L", "/bin/true", vec![], "");

        assert!(!core.swap(a, other));
        assert!(!core.swap(a, 9999));

        let before: Vec<_> = core.all_action_infos();
        assert!(core.swap(a, b));
        assert_eq!(core.command_action_info(a).unwrap().program, "/bin/false");
        assert!(core.swap(a, b));
        assert_eq!(core.all_action_infos(), before);
    }

    #[tokio::test]
    async fn service_action_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());
        let lock_path = object_path("/lock");

        let (shortcut, id) = core.add_service_action("Meta+L", &lock_path, "lock it", ":1.42");
        assert_eq!(shortcut, "Meta+L");
        assert_ne!(id, 0);
        assert_eq!(backend.grabbed_set(), HashSet::from([(46, META_MASK)]));

        // Duplicate registration hands back the existing binding.
        assert_eq!(
            core.add_service_action("Meta+X", &lock_path, "", ":1.42"),
            (shortcut.clone(), id)
        );

        // The preferred alias shows up in the info record.
        core.service_appeared("com.example.foo", ":1.42");
        let info = core.service_action_info(id).unwrap();
        assert_eq!(info.service, "com.example.foo");
        assert_eq!(info.path, "/lock");

        assert_eq!(core.modify_service(&lock_path, "new text", ":1.42"), id);
        assert_eq!(core.action_info(id).unwrap().description, "new text");

        // The peer drops off the bus: transient binding and grab go away.
        core.service_disappeared("com.example.foo", ":1.42");
        core.service_disappeared(":1.42", ":1.42");
        assert!(core.all_action_ids().is_empty());
        assert!(backend.grabbed_set().is_empty());
    }

    #[tokio::test]
    async fn persistent_service_action_survives_alias_disappearance() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let id = core.register_service_action(
            "Meta+L",
            "com.example.locker",
            &object_path("/lock"),
            "",
        );
        assert_ne!(id, 0);

        let active = |core: &Arc<Core>| {
            let data = core.data.lock();
            match &data.shortcut_and_action_by_id.get(&id).unwrap().1.kind {
                ActionKind::Service { active, .. } => *active,
                _ => unreachable!(),
            }
        };
        assert!(!active(&core));

        core.service_appeared("com.example.locker", ":1.9");
        assert!(active(&core));

        core.service_disappeared("com.example.locker", ":1.9");
        assert!(!active(&core));
        assert_eq!(core.all_action_ids(), vec![id]);
        assert!(!backend.grabbed_set().is_empty());
    }

    #[tokio::test]
    async fn remove_service_releases_the_grab() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());
        let lock_path = object_path("/lock");

        let (_, id) = core.add_service_action("Meta+L", &lock_path, "", ":1.42");
        assert_eq!(core.remove_service(&lock_path, ":1.42"), id);
        assert_eq!(core.remove_service(&lock_path, ":1.42"), 0);
        assert!(backend.grabbed_set().is_empty());
        assert!(core.all_action_ids().is_empty());
    }

    #[tokio::test]
    async fn grab_rejects_out_of_range_timeouts_and_reentry() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(FakeBackend::new(), dir.path());

        let outcome = core.clone().grab_shortcut(500).await;
        assert!(outcome.timed_out && !outcome.failed);
        let outcome = core.clone().grab_shortcut(60001).await;
        assert!(outcome.timed_out && !outcome.failed);

        // Arm a grab, then a second request must fail.
        let first = match core.begin_grab(5000) {
            GrabStart::Started(rx) => rx,
            _ => panic!("grab did not arm"),
        };
        let outcome = core.clone().grab_shortcut(5000).await;
        assert!(outcome.failed && !outcome.timed_out);
        drop(first);
    }

    #[tokio::test]
    async fn grab_resolves_with_the_pressed_shortcut() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let pending = tokio::spawn(core.clone().grab_shortcut(5000));
        // Give the request a moment to arm.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if core.data.lock().grab_session.requested {
                break;
            }
        }

        backend.queue_payload(GrabReply {
            shortcut: "Control+space".into(),
            cancelled: false,
        });
        core.data.lock().grab_payload_pending = true;
        core.handle_grab_resolved();

        let outcome = pending.await.unwrap();
        assert_eq!(
            outcome,
            GrabOutcome {
                shortcut: "Control+space".into(),
                failed: false,
                cancelled: false,
                timed_out: false,
            }
        );
    }

    #[tokio::test]
    async fn grab_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let pending = tokio::spawn(core.clone().grab_shortcut(5000));
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if core.data.lock().grab_session.requested {
                break;
            }
        }

        backend.queue_payload(GrabReply {
            shortcut: String::new(),
            cancelled: true,
        });
        core.data.lock().grab_payload_pending = true;
        core.handle_grab_resolved();

        let outcome = pending.await.unwrap();
        assert!(outcome.cancelled && !outcome.failed && !outcome.timed_out);
        assert!(outcome.shortcut.is_empty());
    }

    #[tokio::test]
    async fn grab_times_out_and_releases_the_keyboard() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());

        let outcome = core.clone().grab_shortcut(1000).await;
        assert!(outcome.timed_out && !outcome.failed && !outcome.cancelled);
        assert!(!*backend.keyboard_grabbed.lock().unwrap());
        assert!(!core.data.lock().grab_session.requested);
    }

    #[tokio::test]
    async fn configuration_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let core = test_core(backend.clone(), dir.path());
        core.allow_saving();

        let (_, command_id) = core.register_command(
            "Control+Alt+T",
            "/usr/bin/xterm",
            vec!["-e".into(), "htop, sorted".into()],
            "terminal",
        );
        core.register_method(
            "Meta+X",
            "org.example.Player",
            &object_path("/player"),
            "org.example.Player",
            "Toggle",
            "music",
        );
        core.register_service_action(
            "Meta+L",
            "com.example.locker",
            &object_path("/lock"),
            "locker",
        );
        // Transient bindings must not be persisted.
        core.add_service_action("F1", &object_path("/transient"), "", ":1.5");
        assert!(core.modify_description(command_id, "terminal"));
        {
            let mut data = core.data.lock();
            data.allow_grab.printable = true;
            if let Some((_, action)) = data.shortcut_and_action_by_id.get_mut(&command_id) {
                action.enabled = false;
            }
        }
        core.set_multiple_actions_behaviour(MultipleActionsBehaviour::All);

        let target = dir.path().join("global_actions.ini");
        assert!(target.exists());

        let (general, bindings) = config::load(&[target]);
        assert_eq!(
            general.multiple_actions_behaviour,
            Some(MultipleActionsBehaviour::All)
        );
        assert!(general.allow_grab.printable);

        let fresh = test_core(FakeBackend::new(), dir.path());
        {
            let mut data = fresh.data.lock();
            data.multiple_actions_behaviour = general.multiple_actions_behaviour.unwrap();
            data.allow_grab = general.allow_grab;
        }
        fresh.load_bindings(bindings);

        let originals: Vec<ActionSummary> = core
            .all_action_infos()
            .into_iter()
            .filter(|(id, _)| {
                // Everything but the transient service binding.
                core.data
                    .lock()
                    .shortcut_and_action_by_id
                    .get(id)
                    .is_some_and(|(_, action)| {
                        !matches!(action.kind, ActionKind::Service { persistent: false, .. })
                    })
            })
            .map(|(_, info)| info)
            .collect();
        let reloaded: Vec<ActionSummary> = fresh
            .all_action_infos()
            .into_iter()
            .map(|(_, info)| info)
            .collect();
        assert_eq!(originals, reloaded);
        assert_eq!(
            fresh.multiple_actions_behaviour(),
            MultipleActionsBehaviour::All
        );
    }
}
