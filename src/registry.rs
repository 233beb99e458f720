//! Registry state guarded by the single data lock.
//!
//! Everything the control core and the X11 worker share lives here: the
//! action store, the shortcut indexes, the bidirectional shortcut ↔ X11
//! maps, the service-tracker bookkeeping and the interactive-grab slot.
//! Both threads take the same mutex around every access, so the maps and
//! the grab set are always observed atomically.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::sync::oneshot;
use tracing::debug;
use zbus::zvariant::OwnedObjectPath;

use crate::actions::{Action, BusHandle};
use crate::keys::AllowMasks;

/// An X11 key binding: hardware keycode plus the significant modifier bits.
pub type X11Shortcut = (u8, u32);

/// Identity a service action is registered under: the registering peer's
/// unique name at runtime, or the configured well-known name for persistent
/// bindings loaded from disk.
pub type ServiceClient = (String, OwnedObjectPath);

/// How simultaneous bindings on one shortcut are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultipleActionsBehaviour {
    #[default]
    First,
    Last,
    All,
    None,
}

impl MultipleActionsBehaviour {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
            Self::All => "all",
            Self::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            "all" => Some(Self::All),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Wire representation on the control surface.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::First => 0,
            Self::Last => 1,
            Self::All => 2,
            Self::None => 3,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::First),
            1 => Some(Self::Last),
            2 => Some(Self::All),
            3 => Some(Self::None),
            _ => None,
        }
    }
}

/// Completion payload of an interactive grab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabReply {
    pub shortcut: String,
    pub cancelled: bool,
}

/// Single-slot state of the interactive "grab next shortcut" request.
#[derive(Default)]
pub struct GrabSession {
    pub requested: bool,
    pub pending: Option<oneshot::Sender<GrabReply>>,
}

pub struct Registry {
    /// Primary store, ordered by id.
    pub shortcut_and_action_by_id: BTreeMap<u64, (String, Action)>,
    /// Dispatch index; the sets are ordered by id, which is allocation
    /// (and therefore insertion) order.
    pub ids_by_shortcut: HashMap<String, BTreeSet<u64>>,
    /// Canonical shortcut → X11 binding.
    pub x11_by_shortcut: HashMap<String, X11Shortcut>,
    /// X11 binding → canonical shortcut; mutual inverse of the above.
    pub shortcut_by_x11: HashMap<X11Shortcut, String>,

    pub id_by_service_client: HashMap<ServiceClient, u64>,
    pub paths_by_service: HashMap<String, HashSet<OwnedObjectPath>>,
    pub service_id_by_name: HashMap<String, String>,
    pub service_names_by_id: HashMap<String, BTreeSet<String>>,
    pub preferred_name_by_id: HashMap<String, String>,

    pub last_id: u64,
    pub multiple_actions_behaviour: MultipleActionsBehaviour,
    pub allow_grab: AllowMasks,

    /// Set while the worker captures the keyboard for an interactive grab.
    pub grabbing_shortcut: bool,
    /// Set by the worker once it has written a grab resolution onto the
    /// Response pipe; cleared by whoever drains the payload.
    pub grab_payload_pending: bool,
    pub grab_session: GrabSession,
}

impl Registry {
    pub fn new(behaviour: MultipleActionsBehaviour, allow_grab: AllowMasks) -> Self {
        Self {
            shortcut_and_action_by_id: BTreeMap::new(),
            ids_by_shortcut: HashMap::new(),
            x11_by_shortcut: HashMap::new(),
            shortcut_by_x11: HashMap::new(),
            id_by_service_client: HashMap::new(),
            paths_by_service: HashMap::new(),
            service_id_by_name: HashMap::new(),
            service_names_by_id: HashMap::new(),
            preferred_name_by_id: HashMap::new(),
            last_id: 0,
            multiple_actions_behaviour: behaviour,
            allow_grab,
            grabbing_shortcut: false,
            grab_payload_pending: false,
            grab_session: GrabSession::default(),
        }
    }

    /// Allocate the next action id. Ids are never reused.
    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Insert a binding into the primary store and the dispatch index.
    pub fn bind(&mut self, id: u64, shortcut: String, action: Action) {
        self.ids_by_shortcut
            .entry(shortcut.clone())
            .or_default()
            .insert(id);
        self.shortcut_and_action_by_id
            .insert(id, (shortcut, action));
    }

    /// Drop `id` from the dispatch index entry of `shortcut`. Returns true
    /// when the entry became empty and was removed, meaning the X11 grab
    /// must be released.
    pub fn unbind_from_shortcut(&mut self, shortcut: &str, id: u64) -> bool {
        if let Some(ids) = self.ids_by_shortcut.get_mut(shortcut) {
            ids.remove(&id);
            if ids.is_empty() {
                self.ids_by_shortcut.remove(shortcut);
                return true;
            }
        }
        false
    }

    /// Record a service client registration.
    pub fn track_service_client(&mut self, service: &str, path: &OwnedObjectPath, id: u64) {
        self.paths_by_service
            .entry(service.to_string())
            .or_default()
            .insert(path.clone());
        self.id_by_service_client
            .insert((service.to_string(), path.clone()), id);
    }

    /// Forget a service client registration.
    pub fn untrack_service_client(&mut self, service: &str, path: &OwnedObjectPath) {
        self.id_by_service_client
            .remove(&(service.to_string(), path.clone()));
        if let Some(paths) = self.paths_by_service.get_mut(service) {
            paths.remove(path);
            if paths.is_empty() {
                self.paths_by_service.remove(service);
            }
        }
    }

    /// Resolve the display name for a service identity: the preferred
    /// well-known alias when the identity is a tracked unique owner.
    pub fn preferred_service_name<'a>(&'a self, service: &'a str) -> &'a str {
        self.preferred_name_by_id
            .get(service)
            .map(String::as_str)
            .unwrap_or(service)
    }

    /// Run the bound actions for a canonical shortcut according to the
    /// multi-binding policy. Called by the worker with the data lock held.
    pub fn dispatch(&self, shortcut: &str, bus: &BusHandle) {
        let Some(ids) = self.ids_by_shortcut.get(shortcut) else {
            return;
        };

        match self.multiple_actions_behaviour {
            MultipleActionsBehaviour::First => {
                for id in ids.iter() {
                    if self.activate(*id, bus) {
                        break;
                    }
                }
            }
            MultipleActionsBehaviour::Last => {
                for id in ids.iter().rev() {
                    if self.activate(*id, bus) {
                        break;
                    }
                }
            }
            MultipleActionsBehaviour::All => {
                for id in ids.iter() {
                    self.activate(*id, bus);
                }
            }
            // Disabled actions still count towards the "exactly one" test.
            MultipleActionsBehaviour::None => {
                if ids.len() == 1 {
                    if let Some(&id) = ids.iter().next() {
                        self.activate(id, bus);
                    }
                }
            }
        }
    }

    fn activate(&self, id: u64, bus: &BusHandle) -> bool {
        match self.shortcut_and_action_by_id.get(&id) {
            Some((_, action)) => action.activate(bus),
            None => {
                debug!("dispatch index references unknown action #{}", id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionKind;
    use std::path::Path;
    use std::time::Duration;

    fn command_action(program: &str, args: Vec<String>) -> Action {
        Action::new(
            ActionKind::Command {
                program: program.into(),
                args,
            },
            "",
        )
    }

    fn touch_action(target: &Path) -> Action {
        command_action(
            "/bin/touch",
            vec![target.to_string_lossy().into_owned()],
        )
    }

    async fn wait_for(target: &Path) -> bool {
        for _ in 0..100 {
            if target.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn all_policy_runs_every_binding() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");

        let mut registry =
            Registry::new(MultipleActionsBehaviour::All, AllowMasks::default());
        let id = registry.next_id();
        registry.bind(id, "Meta+X".into(), touch_action(&first));
        let id = registry.next_id();
        registry.bind(id, "Meta+X".into(), touch_action(&second));

        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        registry.dispatch("Meta+X", &bus);

        assert!(wait_for(&first).await);
        assert!(wait_for(&second).await);
    }

    #[tokio::test]
    async fn first_policy_stops_after_a_success() {
        let dir = tempfile::tempdir().unwrap();
        let ran = dir.path().join("ran");
        let skipped = dir.path().join("skipped");

        let mut registry =
            Registry::new(MultipleActionsBehaviour::First, AllowMasks::default());
        // First binding fails to spawn, second succeeds, third must not run.
        let id = registry.next_id();
        registry.bind(
            id,
            "Meta+X".into(),
            command_action("/nonexistent/hotkeyd-test-binary", vec![]),
        );
        let id = registry.next_id();
        registry.bind(id, "Meta+X".into(), touch_action(&ran));
        let id = registry.next_id();
        registry.bind(id, "Meta+X".into(), touch_action(&skipped));

        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        registry.dispatch("Meta+X", &bus);

        assert!(wait_for(&ran).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!skipped.exists());
    }

    #[tokio::test]
    async fn last_policy_runs_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("older");
        let newer = dir.path().join("newer");

        let mut registry =
            Registry::new(MultipleActionsBehaviour::Last, AllowMasks::default());
        let id = registry.next_id();
        registry.bind(id, "Meta+X".into(), touch_action(&older));
        let id = registry.next_id();
        registry.bind(id, "Meta+X".into(), touch_action(&newer));

        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        registry.dispatch("Meta+X", &bus);

        assert!(wait_for(&newer).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!older.exists());
    }

    #[tokio::test]
    async fn none_policy_counts_disabled_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let lone = dir.path().join("lone");
        let paired = dir.path().join("paired");

        let mut registry =
            Registry::new(MultipleActionsBehaviour::None, AllowMasks::default());
        let id = registry.next_id();
        registry.bind(id, "Meta+L".into(), touch_action(&lone));

        let id = registry.next_id();
        registry.bind(id, "Meta+P".into(), touch_action(&paired));
        let mut disabled = touch_action(&paired);
        disabled.enabled = false;
        let id = registry.next_id();
        registry.bind(id, "Meta+P".into(), disabled);

        let bus = BusHandle::disconnected(tokio::runtime::Handle::current());
        registry.dispatch("Meta+L", &bus);
        registry.dispatch("Meta+P", &bus);

        assert!(wait_for(&lone).await);
        // Two ids bound, one of them disabled: still more than one, so
        // nothing runs.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!paired.exists());
    }

    #[test]
    fn unbind_reports_when_shortcut_becomes_free() {
        let mut registry =
            Registry::new(MultipleActionsBehaviour::First, AllowMasks::default());
        let a = registry.next_id();
        registry.bind(a, "Meta+X".into(), command_action("/bin/true", vec![]));
        let b = registry.next_id();
        registry.bind(b, "Meta+X".into(), command_action("/bin/true", vec![]));

        assert!(!registry.unbind_from_shortcut("Meta+X", a));
        assert!(registry.unbind_from_shortcut("Meta+X", b));
        assert!(!registry.ids_by_shortcut.contains_key("Meta+X"));
    }

    #[test]
    fn behaviour_wire_round_trip() {
        for behaviour in [
            MultipleActionsBehaviour::First,
            MultipleActionsBehaviour::Last,
            MultipleActionsBehaviour::All,
            MultipleActionsBehaviour::None,
        ] {
            assert_eq!(
                MultipleActionsBehaviour::from_wire(behaviour.to_wire()),
                Some(behaviour)
            );
            assert_eq!(
                MultipleActionsBehaviour::parse(behaviour.as_str()),
                Some(behaviour)
            );
        }
        assert_eq!(MultipleActionsBehaviour::from_wire(9), None);
    }
}
