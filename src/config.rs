//! The `global_actions.ini` configuration schema.
//!
//! A `[General]` section holds the log level, the multi-binding policy and
//! the six grab allow-masks. Every other section is one binding, named
//! `<shortcut>` or `<shortcut>.<id>`: `Exec` makes it a command action,
//! `DBus-service`/`DBus-path` plus `DBus-interface`/`DBus-method` a method
//! action, and `DBus-service`/`DBus-path` alone a persistent service
//! action. Later files override earlier ones section by section.

use std::path::{Path, PathBuf};

use ini::Ini;
use tracing::{debug, warn};
use zbus::zvariant::OwnedObjectPath;

use crate::actions::ActionKind;
use crate::keys::AllowMasks;
use crate::registry::{MultipleActionsBehaviour, Registry};

#[derive(Debug, Clone, Default)]
pub struct GeneralSettings {
    pub log_level: Option<String>,
    pub multiple_actions_behaviour: Option<MultipleActionsBehaviour>,
    pub allow_grab: AllowMasks,
}

#[derive(Debug, Clone)]
pub enum BindingAction {
    Command {
        program: String,
        args: Vec<String>,
    },
    Method {
        service: String,
        path: OwnedObjectPath,
        interface: String,
        method: String,
    },
    Service {
        service: String,
        path: OwnedObjectPath,
    },
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub shortcut: String,
    pub enabled: bool,
    pub description: String,
    pub action: BindingAction,
}

/// `$HOME/.config/global_actions.ini`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("global_actions.ini")
}

/// Load and merge the configuration files in order. Missing files are
/// skipped; malformed bindings are warned about and dropped, never
/// partially registered.
pub fn load(files: &[PathBuf]) -> (GeneralSettings, Vec<Binding>) {
    let mut general = GeneralSettings::default();
    // Section-name keyed so later files override earlier ones, keeping the
    // position of the first occurrence.
    let mut bindings: Vec<(String, Binding)> = Vec::new();

    for file in files {
        let document = match Ini::load_from_file(file) {
            Ok(document) => document,
            Err(ini::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("cannot read configuration file {}: {}", file.display(), e);
                continue;
            }
        };

        if let Some(properties) = document.section(Some("General")) {
            if let Some(value) = properties.get("LogLevel") {
                general.log_level = Some(value.to_string());
            }
            if let Some(value) = properties.get("MultipleActionsBehaviour") {
                match MultipleActionsBehaviour::parse(value) {
                    Some(behaviour) => general.multiple_actions_behaviour = Some(behaviour),
                    None => warn!("unknown MultipleActionsBehaviour '{}'", value),
                }
            }
            let allow = &mut general.allow_grab;
            for (key, slot) in [
                ("AllowGrabLocks", &mut allow.locks),
                ("AllowGrabBaseSpecial", &mut allow.base_special),
                ("AllowGrabMiscSpecial", &mut allow.misc_special),
                ("AllowGrabBaseKeypad", &mut allow.base_keypad),
                ("AllowGrabMiscKeypad", &mut allow.misc_keypad),
                ("AllowGrabPrintable", &mut allow.printable),
            ] {
                if let Some(value) = properties.get(key) {
                    *slot = parse_bool(value).unwrap_or(*slot);
                }
            }
        }

        for (section, properties) in document.iter() {
            let Some(name) = section else { continue };
            if name == "General" {
                continue;
            }
            let Some(binding) = parse_binding(name, properties) else {
                continue;
            };
            match bindings.iter_mut().find(|(existing, _)| existing.as_str() == name) {
                Some((_, slot)) => *slot = binding,
                None => bindings.push((name.to_string(), binding)),
            }
        }
    }

    (general, bindings.into_iter().map(|(_, binding)| binding).collect())
}

fn parse_binding(section: &str, properties: &ini::Properties) -> Option<Binding> {
    let shortcut = section
        .split_once('.')
        .map_or(section, |(shortcut, _)| shortcut)
        .to_string();
    let enabled = properties
        .get("Enabled")
        .and_then(parse_bool)
        .unwrap_or(true);
    let description = properties.get("Comment").unwrap_or("").to_string();

    if let Some(exec) = properties.get("Exec") {
        let mut values = parse_string_list(exec);
        if values.is_empty() {
            warn!("binding '{}' has an empty Exec list", section);
            return None;
        }
        let program = values.remove(0);
        return Some(Binding {
            shortcut,
            enabled,
            description,
            action: BindingAction::Command {
                program,
                args: values,
            },
        });
    }

    let Some(service) = properties.get("DBus-service").filter(|s| !s.is_empty()) else {
        debug!("ignoring binding '{}': neither Exec nor DBus-service", section);
        return None;
    };
    let Some(path) = properties.get("DBus-path").filter(|p| !p.is_empty()) else {
        warn!("binding '{}' lacks DBus-path", section);
        return None;
    };
    let path = match OwnedObjectPath::try_from(path.to_string()) {
        Ok(path) => path,
        Err(e) => {
            warn!("binding '{}' has an invalid DBus-path: {}", section, e);
            return None;
        }
    };

    if let Some(interface) = properties.get("DBus-interface") {
        let Some(method) = properties.get("DBus-method").filter(|m| !m.is_empty()) else {
            warn!("binding '{}' lacks DBus-method", section);
            return None;
        };
        return Some(Binding {
            shortcut,
            enabled,
            description,
            action: BindingAction::Method {
                service: service.to_string(),
                path,
                interface: interface.to_string(),
                method: method.to_string(),
            },
        });
    }

    Some(Binding {
        shortcut,
        enabled,
        description,
        action: BindingAction::Service {
            service: service.to_string(),
            path,
        },
    })
}

/// Persist the policy, the allow-masks and every persistent binding.
pub fn save(path: &Path, log_level: Option<&str>, registry: &Registry) -> std::io::Result<()> {
    let mut document = Ini::new();

    {
        let mut general = document.with_section(Some("General"));
        if let Some(level) = log_level {
            general.set("LogLevel", level);
        }
        general
            .set(
                "MultipleActionsBehaviour",
                registry.multiple_actions_behaviour.as_str(),
            )
            .set("AllowGrabLocks", bool_str(registry.allow_grab.locks))
            .set(
                "AllowGrabBaseSpecial",
                bool_str(registry.allow_grab.base_special),
            )
            .set(
                "AllowGrabMiscSpecial",
                bool_str(registry.allow_grab.misc_special),
            )
            .set(
                "AllowGrabBaseKeypad",
                bool_str(registry.allow_grab.base_keypad),
            )
            .set(
                "AllowGrabMiscKeypad",
                bool_str(registry.allow_grab.misc_keypad),
            )
            .set(
                "AllowGrabPrintable",
                bool_str(registry.allow_grab.printable),
            );
    }

    for (id, (shortcut, action)) in &registry.shortcut_and_action_by_id {
        let section_name = format!("{}.{}", shortcut, id);
        match &action.kind {
            ActionKind::Command { program, args } => {
                let exec: Vec<&str> = std::iter::once(program.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect();
                document
                    .with_section(Some(section_name.as_str()))
                    .set("Enabled", bool_str(action.enabled))
                    .set("Comment", action.description.as_str())
                    .set("Exec", format_string_list(&exec));
            }
            ActionKind::Method(call) => {
                document
                    .with_section(Some(section_name.as_str()))
                    .set("Enabled", bool_str(action.enabled))
                    .set("Comment", action.description.as_str())
                    .set("DBus-service", call.service.as_str())
                    .set("DBus-path", call.path.to_string())
                    .set("DBus-interface", call.interface.as_str())
                    .set("DBus-method", call.method.as_str());
            }
            ActionKind::Service {
                service,
                path,
                persistent,
                ..
            } => {
                // Transient bindings die with their peer.
                if !persistent {
                    continue;
                }
                document
                    .with_section(Some(section_name.as_str()))
                    .set("Enabled", bool_str(action.enabled))
                    .set("Comment", action.description.as_str())
                    .set("DBus-service", service.as_str())
                    .set("DBus-path", path.to_string());
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    document.write_to_file(path)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Comma-separated list with double-quoting for elements containing
/// commas, quotes or surrounding whitespace.
pub fn format_string_list(values: &[&str]) -> String {
    let mut formatted = String::new();
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            formatted.push_str(", ");
        }
        let needs_quoting = value.is_empty()
            || value.contains(',')
            || value.contains('"')
            || value.trim() != *value;
        if needs_quoting {
            formatted.push('"');
            for ch in value.chars() {
                if ch == '"' || ch == '\\' {
                    formatted.push('\\');
                }
                formatted.push(ch);
            }
            formatted.push('"');
        } else {
            formatted.push_str(value);
        }
    }
    formatted
}

/// Inverse of [`format_string_list`]. Quoted elements keep their exact
/// content; unquoted ones are trimmed.
pub fn parse_string_list(input: &str) -> Vec<String> {
    let mut values = Vec::new();
    if input.trim().is_empty() {
        return values;
    }
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        let mut more = false;
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for ch in chars.by_ref() {
                if escaped {
                    value.push(ch);
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    break;
                } else {
                    value.push(ch);
                }
            }
            values.push(value);
            for ch in chars.by_ref() {
                if ch == ',' {
                    more = true;
                    break;
                }
            }
        } else {
            for ch in chars.by_ref() {
                if ch == ',' {
                    more = true;
                    break;
                }
                value.push(ch);
            }
            values.push(value.trim_end().to_string());
        }
        if !more {
            break;
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn string_list_round_trip() {
        let values = vec!["/usr/bin/xterm", "-e", "htop, sorted", "say \"hi\""];
        let formatted = format_string_list(&values);
        assert_eq!(parse_string_list(&formatted), values);
    }

    #[test]
    fn plain_string_list() {
        assert_eq!(
            parse_string_list("/usr/bin/xterm, -fg, white"),
            vec!["/usr/bin/xterm", "-fg", "white"]
        );
        assert_eq!(parse_string_list(""), Vec::<String>::new());
        assert_eq!(parse_string_list("single"), vec!["single"]);
    }

    #[test]
    fn later_files_override_earlier_sections() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.ini");
        let second = dir.path().join("second.ini");

        std::fs::write(
            &first,
            "[General]\nMultipleActionsBehaviour=all\nAllowGrabPrintable=true\n\
             [Control+Alt+T.1]\nExec=/usr/bin/xterm\nComment=terminal\n",
        )
        .unwrap();
        std::fs::write(
            &second,
            "[General]\nMultipleActionsBehaviour=none\n\
             [Control+Alt+T.1]\nExec=/usr/bin/konsole\n",
        )
        .unwrap();

        let (general, bindings) = load(&[first, second]);
        assert_eq!(
            general.multiple_actions_behaviour,
            Some(MultipleActionsBehaviour::None)
        );
        assert!(general.allow_grab.printable);
        assert_eq!(bindings.len(), 1);
        match &bindings[0].action {
            BindingAction::Command { program, .. } => assert_eq!(program, "/usr/bin/konsole"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn binding_kinds_are_discriminated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("actions.ini");
        let mut out = std::fs::File::create(&file).unwrap();
        writeln!(
            out,
            "[Meta+M.2]\n\
             DBus-service=org.example.Player\n\
             DBus-path=/org/example/Player\n\
             DBus-interface=org.example.Player\n\
             DBus-method=Toggle\n\
             \n\
             [Meta+L.3]\n\
             Enabled=false\n\
             DBus-service=org.example.Locker\n\
             DBus-path=/lock\n\
             \n\
             [Broken.4]\n\
             DBus-service=org.example.Broken\n"
        )
        .unwrap();
        drop(out);

        let (_, bindings) = load(&[file]);
        assert_eq!(bindings.len(), 2);
        assert!(matches!(bindings[0].action, BindingAction::Method { .. }));
        assert!(matches!(bindings[1].action, BindingAction::Service { .. }));
        assert!(!bindings[1].enabled);
        assert_eq!(bindings[1].shortcut, "Meta+L");
    }

    #[test]
    fn missing_files_are_skipped() {
        let (general, bindings) = load(&[PathBuf::from("/nonexistent/global_actions.ini")]);
        assert!(general.log_level.is_none());
        assert!(bindings.is_empty());
    }
}
