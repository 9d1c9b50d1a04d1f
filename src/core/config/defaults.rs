use super::settings::SubjectProfile;

pub const INDEX_SCHEMA_VERSION: &str = "1";

pub const EMBEDDINGS_ROOT: &str = "embeddings/collections";
pub const MANIFEST_PATH: &str = "embeddings/index_manifest.json";
pub const DATA_ROOT: &str = "data";

pub const CHUNK_SIZE: usize = 500;
pub const CHUNK_OVERLAP: usize = 50;

pub const EMBEDDING_CACHE_CAPACITY: usize = 2048;
pub const EMBEDDING_BATCH_SIZE: usize = 32;
pub const EMBEDDING_SERVER_PORT: u16 = 8090;
pub const EMBEDDING_CONTEXT_SIZE: usize = 512;

pub const LLM_SERVER_PORT: u16 = 8088;
pub const LLM_BATCH_SIZE: usize = 512;
pub const LLM_CONTEXT_SIZE: usize = 1024;
pub const LLM_MAX_TOKENS: usize = 256;
pub const LLM_TEMPERATURE: f32 = 0.7;
pub const LLM_STARTUP_TIMEOUT_SECS: u64 = 60;
pub const WARMUP_PROMPT: &str = "Hola, ¿puedes confirmar que estás listo?";

pub const DEFAULT_SUBJECT: &str = "base";
pub const ENGLISH_SUBJECT: &str = "Ingles";
pub const TOP_K: usize = 3;
/// Squared L2 distance above which a retrieved chunk is discarded.
pub const DISTANCE_THRESHOLD: f32 = 1.2;

pub const SERVER_HOST: &str = "127.0.0.1";
pub const SERVER_PORT: u16 = 8000;

pub fn greetings() -> Vec<String> {
    [
        "hola",
        "buenos dias",
        "buenas tardes",
        "buenas noches",
        "gracias",
        "adios",
        "hi",
        "hello",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn subjects() -> Vec<SubjectProfile> {
    [
        ("Matematicas", "números, ecuaciones, geometría, cálculo, álgebra"),
        (
            "Fisica",
            "movimiento, fuerzas, energía, ondas, electricidad, velocidad, tiempo",
        ),
        (
            "Lengua",
            "gramática, ortografía, literatura, análisis de textos, poemas",
        ),
        (
            "Historia",
            "eventos pasados, personajes históricos, fechas, guerras, civilizaciones",
        ),
        (
            "Filosofia",
            "pensamiento, ética, moral, existencia, filósofos, sentido de la vida",
        ),
        (
            "Ingles",
            "aprender inglés, traducciones al inglés, vocabulario en inglés, 'cómo se dice'",
        ),
    ]
    .iter()
    .map(|(name, description)| SubjectProfile {
        name: name.to_string(),
        description: description.to_string(),
    })
    .collect()
}
