//! Identity validation and guest identity minting.
//!
//! uids look like `u_<alnum>{1,32}`, display names like `<letter><alnum>{2,31}`.
//! Guests get `u_` + 8 random hex and an `<Adjective><Noun><3 digits>` name.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "Brisk", "Quiet", "Mellow", "Rapid", "Dusty", "Vivid", "Sly", "Bold",
    "Calm", "Eager", "Fuzzy", "Glossy", "Humble", "Jolly", "Keen", "Lucky",
    "Misty", "Nimble", "Odd", "Plucky", "Rustic", "Snug", "Tidy", "Witty",
];

const NOUNS: &[&str] = &[
    "Otter", "Heron", "Badger", "Finch", "Lynx", "Marmot", "Newt", "Osprey",
    "Pika", "Quail", "Raven", "Stoat", "Tern", "Urchin", "Vole", "Wren",
    "Moth", "Ibis", "Koala", "Loon", "Gull", "Crane", "Shrew", "Tapir",
];

pub fn is_valid_uid(uid: &str) -> bool {
    let Some(rest) = uid.strip_prefix("u_") else {
        return false;
    };
    (1..=32).contains(&rest.len()) && rest.bytes().all(|b| b.is_ascii_alphanumeric())
}

pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    (3..=32).contains(&bytes.len())
        && bytes[0].is_ascii_alphabetic()
        && bytes[1..].iter().all(|b| b.is_ascii_alphanumeric())
}

/// Fresh guest uid: `u_` + 8 random hex digits.
pub fn generate_uid() -> String {
    let mut rng = rand::rng();
    format!("u_{:08x}", rng.random::<u32>())
}

/// Fresh guest display name: `<Adjective><Noun><3 digits>`.
pub fn generate_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    format!("{adjective}{noun}{:03}", rng.random_range(0..1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_validation() {
        assert!(is_valid_uid("u_a"));
        assert!(is_valid_uid("u_deadbeef"));
        assert!(is_valid_uid(&format!("u_{}", "a".repeat(32))));
        assert!(!is_valid_uid("u_"));
        assert!(!is_valid_uid("deadbeef"));
        assert!(!is_valid_uid("u_dead-beef"));
        assert!(!is_valid_uid(&format!("u_{}", "a".repeat(33))));
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("Abc"));
        assert!(is_valid_name("BriskOtter042"));
        assert!(is_valid_name(&format!("A{}", "b".repeat(31))));
        assert!(!is_valid_name("Ab"));
        assert!(!is_valid_name("1Abc"));
        assert!(!is_valid_name("Ab cd"));
        assert!(!is_valid_name(&format!("A{}", "b".repeat(32))));
    }

    #[test]
    fn generated_identities_validate() {
        for _ in 0..64 {
            assert!(is_valid_uid(&generate_uid()));
            assert!(is_valid_name(&generate_name()));
        }
    }
}
