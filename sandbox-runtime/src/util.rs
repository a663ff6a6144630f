use rand::RngCore;
use rand::rngs::OsRng;
use uuid::Uuid;

/// Generate a sandbox id: the first 12 hex characters of a fresh UUID,
/// lowercase.
pub fn generate_sandbox_id() -> String {
    let mut simple = Uuid::new_v4().simple().to_string();
    simple.truncate(12);
    simple
}

/// Generate a session join token: 24 bytes from the OS CSPRNG, hex-encoded
/// to 48 characters.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a service credential password: 16 bytes from the OS CSPRNG,
/// hex-encoded and truncated to 16 characters.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let mut encoded = hex::encode(bytes);
    encoded.truncate(16);
    encoded
}

/// Rewrite a sandbox id into a form legal in SQL identifiers:
/// hyphens become underscores.
pub fn sql_safe(id: &str) -> String {
    id.replace('-', "_")
}
