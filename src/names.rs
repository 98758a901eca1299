//! Display-name identifiers for new connections.
//!
//! Identifiers double as the human-readable name shown in the client's
//! roster ("🦊 Fox"). The pool is small, so once plain names start colliding
//! the source appends a short random tag ("🦊 Fox 3f9a").

use rand::seq::SliceRandom;
use uuid::Uuid;

const ANIMAL_NAMES: &[&str] = &[
    "🐶 Puppy", "🐱 Kitty", "🐭 Mouse", "🐹 Hamster", "🐰 Bunny", "🦊 Fox", "🐻 Bear", "🐼 Panda",
    "🐨 Koala", "🐯 Tiger", "🦁 Lion", "🐮 Cow", "🐷 Piggy", "🐸 Froggy", "🐵 Monkey", "🐔 Chicken",
    "🦄 Unicorn", "🐙 Octopus", "🦋 Butterfly", "🦜 Parrot", "🦒 Giraffe", "🦘 Kangaroo", "🦥 Sloth",
    "🦦 Otter",
];

/// Produces identifier candidates. The registry decides which one is free.
pub trait NameSource: Send + Sync {
    /// Candidate for the given zero-based allocation attempt.
    fn candidate(&self, attempt: usize) -> String;
}

/// Random animal names, tagged with a random suffix after repeated collisions.
#[derive(Debug, Clone, Default)]
pub struct AnimalNames;

impl NameSource for AnimalNames {
    fn candidate(&self, attempt: usize) -> String {
        let animal = ANIMAL_NAMES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("🦦 Otter");

        if attempt < ANIMAL_NAMES.len() {
            animal.to_string()
        } else {
            let tag = Uuid::new_v4().simple().to_string();
            format!("{} {}", animal, tag.get(..4).unwrap_or(&tag))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_first() {
        let names = AnimalNames;
        let name = names.candidate(0);
        assert!(ANIMAL_NAMES.contains(&name.as_str()));
    }

    #[test]
    fn test_tagged_after_pool_exhausted() {
        let names = AnimalNames;
        let name = names.candidate(ANIMAL_NAMES.len());
        assert!(!ANIMAL_NAMES.contains(&name.as_str()));

        let (animal, tag) = name.rsplit_once(' ').unwrap();
        assert!(ANIMAL_NAMES.contains(&animal));
        assert_eq!(tag.len(), 4);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
