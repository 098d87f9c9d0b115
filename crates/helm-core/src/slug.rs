use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crisp", "eager", "fleet",
    "gentle", "keen", "lively", "lucid", "mellow", "nimble", "quiet", "rapid",
    "solid", "steady", "swift", "vivid",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "comet", "falcon", "garnet", "harbor", "heron",
    "lantern", "maple", "meadow", "otter", "pebble", "pine", "raven", "reef",
    "river", "sparrow", "summit", "tern", "willow",
];

const TAIL_LEN: usize = 4;
const TAIL_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Human-readable session slug, e.g. `swift-otter-4k2p`.
pub fn create() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let tail: String = (0..TAIL_LEN)
        .map(|_| TAIL_ALPHABET[rng.gen_range(0..TAIL_ALPHABET.len())] as char)
        .collect();
    format!("{adjective}-{noun}-{tail}")
}
