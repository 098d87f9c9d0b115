use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;

/// Entity kinds that get their own ID namespace.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Kind {
    Session,
    Message,
    Part,
    Project,
    Permission,
}

impl Kind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Session => "ses",
            Self::Message => "msg",
            Self::Part => "prt",
            Self::Project => "prj",
            Self::Permission => "per",
        }
    }
}

const LENGTH: usize = 26;
const TIME_HEX_LEN: usize = 16;
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

struct Clock {
    last_millis: u64,
    counter: u64,
}

static CLOCK: Mutex<Clock> = Mutex::new(Clock {
    last_millis: 0,
    counter: 0,
});

/// Generate an ID that sorts lexicographically after every ID previously
/// generated for `kind` in this process.
pub fn ascending(kind: Kind) -> String {
    generate(kind, false, None)
}

/// Generate an ID that sorts lexicographically before every ID previously
/// generated for `kind`. Sessions use this so the newest session carries the
/// smallest ID and sorts ahead of its own first message.
pub fn descending(kind: Kind) -> String {
    generate(kind, true, None)
}

/// Descending ID with a caller-supplied tail instead of the random suffix.
pub fn descending_with(kind: Kind, suffix: &str) -> String {
    generate(kind, true, Some(suffix))
}

/// Whether `id` carries the prefix of `kind`.
pub fn is_kind(id: &str, kind: Kind) -> bool {
    id.len() > kind.prefix().len() + 1 && id.starts_with(kind.prefix()) && id.as_bytes()[kind.prefix().len()] == b'_'
}

fn generate(kind: Kind, descending: bool, suffix: Option<&str>) -> String {
    // 12 bits of per-millisecond counter keep same-millisecond IDs ordered;
    // the clock never moves backward even if the wall clock does. The value
    // fits in 8 big-endian bytes, rendered as 16 hex chars.
    let value = {
        let now = Utc::now().timestamp_millis() as u64;
        let mut clock = CLOCK.lock();
        if now > clock.last_millis {
            clock.last_millis = now;
            clock.counter = 0;
        }
        clock.counter += 1;
        clock.last_millis * 0x1000 + clock.counter
    };

    let mut bytes = [0u8; 8];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = ((value >> (56 - 8 * i)) & 0xff) as u8;
    }
    if descending {
        for byte in &mut bytes {
            *byte = !*byte;
        }
    }

    let mut out = String::with_capacity(kind.prefix().len() + 1 + LENGTH);
    out.push_str(kind.prefix());
    out.push('_');
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    match suffix {
        Some(suffix) => out.push_str(suffix),
        None => {
            let mut rng = rand::thread_rng();
            for _ in 0..(LENGTH - TIME_HEX_LEN) {
                out.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(ascending(Kind::Message).starts_with("msg_"));
        assert!(ascending(Kind::Part).starts_with("prt_"));
        assert!(descending(Kind::Session).starts_with("ses_"));
        assert!(ascending(Kind::Project).starts_with("prj_"));
        assert!(ascending(Kind::Permission).starts_with("per_"));
    }

    #[test]
    fn ascending_is_sorted() {
        let ids: Vec<String> = (0..1000).map(|_| ascending(Kind::Message)).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), 1000);
    }

    #[test]
    fn descending_reverses_order() {
        let ids: Vec<String> = (0..100).map(|_| descending(Kind::Session)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] > pair[1], "{} should sort after {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn descending_with_suffix() {
        let id = descending_with(Kind::Session, "imported");
        assert!(id.starts_with("ses_"));
        assert!(id.ends_with("imported"));
    }

    #[test]
    fn kind_check() {
        assert!(is_kind(&ascending(Kind::Message), Kind::Message));
        assert!(!is_kind(&ascending(Kind::Message), Kind::Session));
        assert!(!is_kind("msg", Kind::Message));
    }

    #[test]
    fn concurrent_generation_stays_unique() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..200).map(|_| ascending(Kind::Part)).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let len = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), len);
    }
}
