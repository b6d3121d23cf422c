use rand::Rng;
use uuid::Uuid;

/// Produces display names for connections.
pub trait NicknameGenerator: Send + Sync {
    fn generate(&self) -> String;
}

const ADJECTIVES: &[&str] = &[
    "Cute", "Cool", "Kind", "Brave", "Clever", "Fun", "Happy", "Lovely", "Energetic", "Shining",
    "Peaceful", "Mysterious", "Free", "Charming", "Delicate", "Elegant", "Lively", "Strong",
    "Unique", "Scary", "Dreamy", "Relaxed", "Passionate", "Precious", "Fresh", "Creative",
    "Excellent", "Witty", "Interesting", "Famous", "Wise", "Bold", "Calm", "Swift", "Gorgeous",
    "Persistent", "Affectionate", "Agile", "Quick", "Quiet", "Cheerful", "Honest", "Forgiving",
    "Courageous", "Sincere", "Curious", "Humble", "Generous",
];

const NAMES: &[&str] = &[
    "Ryan", "Apeach", "Con", "Muzi", "Neo", "Frodo", "Jay-G", "Tube", "Chulbong",
];

/// `"<Adjective> <Name> [<8 hex>]"`, e.g. `"Brave Neo [3f2a9c1d]"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdjectiveNameGenerator;

impl NicknameGenerator for AdjectiveNameGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
        let name = NAMES[rng.gen_range(0..NAMES.len())];
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{adjective} {name} [{}]", &suffix[..8])
    }
}
