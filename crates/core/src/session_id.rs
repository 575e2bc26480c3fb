// crates/core/src/session_id.rs
//! Session identifiers.
//!
//! A main session id is 8 chars of url-safe base64 (6 random bytes),
//! rejection-sampled until at least one ASCII uppercase letter is present so
//! ids are visually distinguishable from common lowercase tokens. Temporary
//! sessions carry a `.` prefix and are eligible for periodic cleanup.
//!
//! Sub-sessions append `.<suffix>` segments: `AbCdEfGh.tool1.run2`. Splitting
//! happens at the first `.` *after* the optional leading temporary dot, so
//! `.tmpAbCd.x` splits into main `.tmpAbCd` and local suffix `x`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Length of a generated main session id, in characters.
pub const MAIN_ID_LEN: usize = 8;

/// Prefix marking a temporary session.
pub const TEMP_PREFIX: char = '.';

/// A session id split into its main and local parts.
///
/// `local` is `""` for the main session itself; for sub-sessions it is the
/// dot-joined suffix without the separating dot (`"tool1.run2"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub main: String,
    pub local: String,
}

impl SessionId {
    /// Split a wire-format id at the first `.` after the temp prefix.
    pub fn parse(id: &str) -> Self {
        let (prefix, rest) = match id.strip_prefix(TEMP_PREFIX) {
            Some(rest) => (".", rest),
            None => ("", id),
        };
        match rest.split_once('.') {
            Some((main, local)) => Self {
                main: format!("{prefix}{main}"),
                local: local.to_string(),
            },
            None => Self {
                main: format!("{prefix}{rest}"),
                local: String::new(),
            },
        }
    }

    /// Reassemble the wire-format id.
    pub fn to_wire(&self) -> String {
        if self.local.is_empty() {
            self.main.clone()
        } else {
            format!("{}.{}", self.main, self.local)
        }
    }

    /// Derive a sub-session id by appending one more suffix segment.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let local = if self.local.is_empty() {
            suffix.to_string()
        } else {
            format!("{}.{}", self.local, suffix)
        };
        Self {
            main: self.main.clone(),
            local,
        }
    }

    pub fn is_main(&self) -> bool {
        self.local.is_empty()
    }

    pub fn is_temporary(&self) -> bool {
        self.main.starts_with(TEMP_PREFIX)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Generate a fresh main session id.
pub fn generate() -> String {
    loop {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = URL_SAFE_NO_PAD.encode(bytes);
        debug_assert_eq!(id.len(), MAIN_ID_LEN);
        // Rejection sampling: require at least one uppercase letter.
        if id.bytes().any(|b| b.is_ascii_uppercase()) {
            return id;
        }
    }
}

/// Generate a temporary main session id (`.`-prefixed).
pub fn generate_temporary() -> String {
    format!("{TEMP_PREFIX}{}", generate())
}

/// Whether a wire-format id denotes a temporary session.
pub fn is_temporary(id: &str) -> bool {
    id.starts_with(TEMP_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn generated_ids_are_eight_urlsafe_chars_with_uppercase() {
        for _ in 0..200 {
            let id = generate();
            assert_eq!(id.len(), MAIN_ID_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
            assert!(id.bytes().any(|b| b.is_ascii_uppercase()), "no uppercase in {id}");
        }
    }

    #[test]
    fn temporary_ids_keep_the_dot_prefix() {
        let id = generate_temporary();
        assert!(id.starts_with('.'));
        assert_eq!(id.len(), MAIN_ID_LEN + 1);
        assert!(is_temporary(&id));
    }

    #[test]
    fn parse_main_only() {
        let sid = SessionId::parse("AbCdEfGh");
        assert_eq!(sid.main, "AbCdEfGh");
        assert_eq!(sid.local, "");
        assert!(sid.is_main());
        assert_eq!(sid.to_wire(), "AbCdEfGh");
    }

    #[test]
    fn parse_sub_session_keeps_remaining_dots_in_local() {
        let sid = SessionId::parse("AbCdEfGh.tool1.run2");
        assert_eq!(sid.main, "AbCdEfGh");
        assert_eq!(sid.local, "tool1.run2");
        assert_eq!(sid.to_wire(), "AbCdEfGh.tool1.run2");
    }

    #[test]
    fn parse_temporary_main_keeps_prefix() {
        let sid = SessionId::parse(".tmpAbCd");
        assert_eq!(sid.main, ".tmpAbCd");
        assert_eq!(sid.local, "");
        assert!(sid.is_temporary());

        let sid = SessionId::parse(".tmpAbCd.x");
        assert_eq!(sid.main, ".tmpAbCd");
        assert_eq!(sid.local, "x");
        assert_eq!(sid.to_wire(), ".tmpAbCd.x");
    }

    #[test]
    fn with_suffix_appends_segments() {
        let sid = SessionId::parse("AbCdEfGh");
        let sub = sid.with_suffix("xyz");
        assert_eq!(sub.to_wire(), "AbCdEfGh.xyz");
        let subsub = sub.with_suffix("q");
        assert_eq!(subsub.to_wire(), "AbCdEfGh.xyz.q");
        assert_eq!(subsub.main, "AbCdEfGh");
    }
}
