//! MD5 password authentication.
//!
//! The client proves knowledge of the password by sending
//! `"md5" + hex(md5(hex(md5(password || user)) || salt))` in response to an
//! AuthenticationMD5Password challenge carrying a fresh 4-byte salt.

use std::collections::HashMap;

pub fn generate_salt() -> [u8; 4] {
    rand::random()
}

/// Compute the response the client is expected to send for this challenge.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = Vec::with_capacity(inner.len() + salt.len());
    outer.extend_from_slice(inner.as_bytes());
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// The user table the server authenticates against.
pub struct Credentials {
    users: HashMap<String, String>,
}

impl Credentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Check a PasswordMessage payload against the challenge salt.
    /// Unknown users fail the same way as wrong passwords.
    pub fn verify_md5(&self, user: &str, salt: &[u8; 4], response: &str) -> bool {
        match self.users.get(user) {
            Some(password) => md5_password(user, password, salt) == response,
            None => false,
        }
    }
}
