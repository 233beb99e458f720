//! Modifier masks, keysym classification and canonical shortcut strings.
//!
//! A canonical shortcut is `Mod+...+Key` with the modifiers in a fixed
//! order (Level5, Level3, Meta, Alt, Control, Shift) and the key being the
//! name of the primary keysym on the physical key. Only the six significant
//! modifier bits participate; lock-style modifiers are handled at grab time
//! by fanning out over every lock-bit combination.

use xkbcommon::xkb;
use xkbcommon::xkb::keysyms;

pub const SHIFT_MASK: u32 = 1 << 0;
pub const CONTROL_MASK: u32 = 1 << 2;
/// Mod1.
pub const ALT_MASK: u32 = 1 << 3;
/// Mod3. Level5 sits on Mod3 in the XKB mapping this daemon targets.
pub const LEVEL5_MASK: u32 = 1 << 5;
/// Mod4.
pub const META_MASK: u32 = 1 << 6;
/// Mod5. Level3 sits on Mod5, mirroring the Level5/Mod3 assignment.
pub const LEVEL3_MASK: u32 = 1 << 7;

/// The six modifier bits that take part in shortcut identity.
pub const SIGNIFICANT_MASK: u32 =
    SHIFT_MASK | CONTROL_MASK | ALT_MASK | META_MASK | LEVEL3_MASK | LEVEL5_MASK;

/// Every value of the low 8 modifier bits with the significant bits cleared.
///
/// A grab for (keycode, mask) is installed once per element so that lock
/// modifiers (CapsLock, NumLock, ...) cannot defeat it.
pub fn lock_combinations() -> Vec<u32> {
    let ignore = 0xffu32 ^ SIGNIFICANT_MASK;
    let mut combinations: Vec<u32> = (0u32..0x100).map(|bits| bits & ignore).collect();
    combinations.sort_unstable();
    combinations.dedup();
    combinations
}

/// Resolve a modifier token from a shortcut string.
pub fn modifier_mask(token: &str) -> Option<u32> {
    match token {
        "Shift" => Some(SHIFT_MASK),
        "Control" => Some(CONTROL_MASK),
        "Alt" => Some(ALT_MASK),
        "Meta" => Some(META_MASK),
        "Level3" => Some(LEVEL3_MASK),
        "Level5" => Some(LEVEL5_MASK),
        _ => None,
    }
}

/// Compose the canonical textual form from a mask and a key name.
pub fn compose_shortcut(mask: u32, key: &str) -> String {
    let mut shortcut = String::new();
    if mask & LEVEL5_MASK != 0 {
        shortcut.push_str("Level5+");
    }
    if mask & LEVEL3_MASK != 0 {
        shortcut.push_str("Level3+");
    }
    if mask & META_MASK != 0 {
        shortcut.push_str("Meta+");
    }
    if mask & ALT_MASK != 0 {
        shortcut.push_str("Alt+");
    }
    if mask & CONTROL_MASK != 0 {
        shortcut.push_str("Control+");
    }
    if mask & SHIFT_MASK != 0 {
        shortcut.push_str("Shift+");
    }
    shortcut.push_str(key);
    shortcut
}

/// Keysym name lookup; returns `None` for NoSymbol or unnamed keysyms.
pub fn keysym_name(keysym: u32) -> Option<String> {
    if keysym == keysyms::KEY_NoSymbol {
        return None;
    }
    let name = xkb::keysym_get_name(xkb::Keysym::new(keysym));
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Name → keysym; `None` when the name does not resolve.
pub fn keysym_from_name(name: &str) -> Option<u32> {
    match xkb::keysym_from_name(name, xkb::KEYSYM_NO_FLAGS).raw() {
        keysyms::KEY_NoSymbol => None,
        keysym => Some(keysym),
    }
}

/// Escape with no modifiers cancels an interactive grab.
pub fn is_escape(keysym: u32, modifiers: u32) -> bool {
    keysym == keysyms::KEY_Escape && modifiers == 0
}

/// Modifier keysyms never terminate an interactive grab.
pub fn is_modifier(keysym: u32) -> bool {
    matches!(
        keysym,
        keysyms::KEY_Shift_L
            | keysyms::KEY_Shift_R
            | keysyms::KEY_Control_L
            | keysyms::KEY_Control_R
            | keysyms::KEY_Meta_L
            | keysyms::KEY_Meta_R
            | keysyms::KEY_Alt_L
            | keysyms::KEY_Alt_R
            | keysyms::KEY_Super_L
            | keysyms::KEY_Super_R
            | keysyms::KEY_Hyper_L
            | keysyms::KEY_Hyper_R
            | keysyms::KEY_ISO_Level3_Shift
            | keysyms::KEY_ISO_Level5_Shift
            | keysyms::KEY_ISO_Group_Shift
    )
}

/// Which otherwise-typeable key classes may be captured by an interactive
/// grab when pressed without modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowMasks {
    pub locks: bool,
    pub base_special: bool,
    pub misc_special: bool,
    pub base_keypad: bool,
    pub misc_keypad: bool,
    pub printable: bool,
}

impl Default for AllowMasks {
    fn default() -> Self {
        Self {
            locks: false,
            base_special: false,
            misc_special: true,
            base_keypad: true,
            misc_keypad: true,
            printable: false,
        }
    }
}

impl AllowMasks {
    /// Gate a keysym pressed with `modifiers` (significant bits only).
    /// Keys outside the six fixed classes are always allowed.
    pub fn is_allowed(&self, keysym: u32, modifiers: u32) -> bool {
        match keysym {
            keysyms::KEY_Scroll_Lock
            | keysyms::KEY_Num_Lock
            | keysyms::KEY_Caps_Lock
            | keysyms::KEY_ISO_Lock
            | keysyms::KEY_ISO_Level3_Lock
            | keysyms::KEY_ISO_Level5_Lock
            | keysyms::KEY_ISO_Group_Lock
            | keysyms::KEY_ISO_Next_Group_Lock
            | keysyms::KEY_ISO_Prev_Group_Lock
            | keysyms::KEY_ISO_First_Group_Lock
            | keysyms::KEY_ISO_Last_Group_Lock => {
                if modifiers == 0 {
                    return self.locks;
                }
            }

            keysyms::KEY_Home
            | keysyms::KEY_Left
            | keysyms::KEY_Up
            | keysyms::KEY_Right
            | keysyms::KEY_Down
            | keysyms::KEY_Page_Up
            | keysyms::KEY_Page_Down
            | keysyms::KEY_End
            | keysyms::KEY_Delete
            | keysyms::KEY_Insert
            | keysyms::KEY_BackSpace
            | keysyms::KEY_Tab
            | keysyms::KEY_Return
            | keysyms::KEY_space => {
                if modifiers == 0 {
                    return self.base_special;
                }
            }

            keysyms::KEY_Pause
            | keysyms::KEY_Print
            | keysyms::KEY_Linefeed
            | keysyms::KEY_Clear
            | keysyms::KEY_Multi_key
            | keysyms::KEY_Codeinput
            | keysyms::KEY_SingleCandidate
            | keysyms::KEY_MultipleCandidate
            | keysyms::KEY_PreviousCandidate
            | keysyms::KEY_Begin
            | keysyms::KEY_Select
            | keysyms::KEY_Execute
            | keysyms::KEY_Undo
            | keysyms::KEY_Redo
            | keysyms::KEY_Menu
            | keysyms::KEY_Find
            | keysyms::KEY_Cancel
            | keysyms::KEY_Help
            | keysyms::KEY_Sys_Req
            | keysyms::KEY_Break => {
                if modifiers == 0 {
                    return self.misc_special;
                }
            }

            keysyms::KEY_KP_Enter
            | keysyms::KEY_KP_Home
            | keysyms::KEY_KP_Left
            | keysyms::KEY_KP_Up
            | keysyms::KEY_KP_Right
            | keysyms::KEY_KP_Down
            | keysyms::KEY_KP_Page_Up
            | keysyms::KEY_KP_Page_Down
            | keysyms::KEY_KP_End
            | keysyms::KEY_KP_Begin
            | keysyms::KEY_KP_Insert
            | keysyms::KEY_KP_Delete
            | keysyms::KEY_KP_Multiply
            | keysyms::KEY_KP_Add
            | keysyms::KEY_KP_Subtract
            | keysyms::KEY_KP_Decimal
            | keysyms::KEY_KP_Divide
            | keysyms::KEY_KP_0
            | keysyms::KEY_KP_1
            | keysyms::KEY_KP_2
            | keysyms::KEY_KP_3
            | keysyms::KEY_KP_4
            | keysyms::KEY_KP_5
            | keysyms::KEY_KP_6
            | keysyms::KEY_KP_7
            | keysyms::KEY_KP_8
            | keysyms::KEY_KP_9 => {
                if modifiers == 0 {
                    return self.base_keypad;
                }
            }

            keysyms::KEY_KP_Space
            | keysyms::KEY_KP_Tab
            | keysyms::KEY_KP_F1
            | keysyms::KEY_KP_F2
            | keysyms::KEY_KP_F3
            | keysyms::KEY_KP_F4
            | keysyms::KEY_KP_Equal
            | keysyms::KEY_KP_Separator => {
                if modifiers == 0 {
                    return self.misc_keypad;
                }
            }

            keysyms::KEY_grave
            | keysyms::KEY_1
            | keysyms::KEY_2
            | keysyms::KEY_3
            | keysyms::KEY_4
            | keysyms::KEY_5
            | keysyms::KEY_6
            | keysyms::KEY_7
            | keysyms::KEY_8
            | keysyms::KEY_9
            | keysyms::KEY_0
            | keysyms::KEY_minus
            | keysyms::KEY_equal
            | keysyms::KEY_Q
            | keysyms::KEY_W
            | keysyms::KEY_E
            | keysyms::KEY_R
            | keysyms::KEY_T
            | keysyms::KEY_Y
            | keysyms::KEY_U
            | keysyms::KEY_I
            | keysyms::KEY_O
            | keysyms::KEY_P
            | keysyms::KEY_bracketleft
            | keysyms::KEY_bracketright
            | keysyms::KEY_backslash
            | keysyms::KEY_A
            | keysyms::KEY_S
            | keysyms::KEY_D
            | keysyms::KEY_F
            | keysyms::KEY_G
            | keysyms::KEY_H
            | keysyms::KEY_J
            | keysyms::KEY_K
            | keysyms::KEY_L
            | keysyms::KEY_semicolon
            | keysyms::KEY_apostrophe
            | keysyms::KEY_Z
            | keysyms::KEY_X
            | keysyms::KEY_C
            | keysyms::KEY_V
            | keysyms::KEY_B
            | keysyms::KEY_N
            | keysyms::KEY_M
            | keysyms::KEY_comma
            | keysyms::KEY_period
            | keysyms::KEY_slash => {
                // Shift and the level selectors still produce a printable
                // character, so they do not count as "modifiers present".
                if modifiers & !(SHIFT_MASK | LEVEL3_MASK | LEVEL5_MASK) == 0 {
                    return self.printable;
                }
            }

            _ => {}
        }
        true
    }
}

/// Lowercase-letter keysym range; keys whose first symbol falls in it use
/// their second (shifted) symbol as the canonical name.
pub fn is_latin_lowercase(keysym: u32) -> bool {
    (keysyms::KEY_a..=keysyms::KEY_z).contains(&keysym)
}
