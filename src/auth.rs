// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VNC authentication implementation.
//!
//! This module implements VNC Authentication (security type 2) as specified
//! in RFC 6143 Section 7.2.2. It uses DES encryption with a VNC-specific
//! bit reversal quirk for challenge-response authentication.
//!
//! # Protocol
//!
//! 1. Server generates a 16-byte random challenge and sends it
//! 2. Client encrypts the challenge using the password as the DES key
//!    (with bit-reversed bytes) and sends the 16-byte result back
//! 3. Server runs the same transform on its stored password and compares
//!    in constant time
//!
//! Both the client-role and server-role engines use [`encrypt_challenge`];
//! only the server holds a [`VncAuth`] verifier.
//!
//! # Security Note
//!
//! VNC Authentication is a legacy protocol and has known security
//! limitations. It should only be used on trusted networks or in
//! conjunction with TLS/SSL tunneling.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;

/// Derives the 8-byte DES key from a VNC password.
///
/// The password is truncated or zero-padded to exactly 8 bytes, and each
/// byte's bit order is reversed (the historical VNC key quirk).
pub fn derive_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, &byte) in key.iter_mut().zip(password.as_bytes().iter().take(8)) {
        *slot = byte.reverse_bits();
    }
    key
}

/// Encrypts a 16-byte challenge with the VNC password.
///
/// The challenge is encrypted as two independent 8-byte DES blocks in ECB
/// mode using the key from [`derive_key`]. The result is the 16-byte
/// response the client sends and the server expects.
pub fn encrypt_challenge(challenge: &[u8; 16], password: &str) -> [u8; 16] {
    let cipher = Des::new_from_slice(&derive_key(password)).expect("8-byte key");

    let mut response = *challenge;
    for half in response.chunks_exact_mut(8) {
        let mut block = [0u8; 8];
        block.copy_from_slice(half);
        let mut block = block.into();
        cipher.encrypt_block(&mut block);
        half.copy_from_slice(&block);
    }
    response
}

/// Server-side verifier for the VNC Authentication scheme.
///
/// Holds the configured password, generates the random challenge, and
/// checks client responses.
pub struct VncAuth {
    password: Option<String>,
}

impl VncAuth {
    /// Creates a verifier. With no password configured every response is
    /// rejected; the engine never offers VNCAuth in that case.
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    /// Whether a password is configured, and therefore whether VNCAuth
    /// is offered at all.
    pub fn enabled(&self) -> bool {
        self.password.is_some()
    }

    /// Generates a cryptographically random 16-byte challenge.
    pub fn generate_challenge(&self) -> [u8; 16] {
        let mut rng = rand::rng();
        let mut challenge = [0u8; 16];
        rng.fill(&mut challenge);
        challenge
    }

    /// Verifies a client's 16-byte response against the challenge that
    /// was sent.
    ///
    /// Runs the same DES transform over the stored password and compares
    /// the two ciphertexts in constant time so the comparison leaks no
    /// prefix information.
    pub fn verify_response(&self, response: &[u8], challenge: &[u8; 16]) -> bool {
        let Some(ref password) = self.password else {
            return false;
        };
        if response.len() != 16 {
            return false;
        }
        let expected = encrypt_challenge(challenge, password);
        constant_time_eq(response, &expected)
    }
}

/// Constant-time slice comparison. Both inputs must be the same length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_pads_and_reverses() {
        // "pass" -> "pass\0\0\0\0" with each byte bit-reversed.
        let key = derive_key("pass");
        assert_eq!(key[0], b'p'.reverse_bits());
        assert_eq!(key[3], b's'.reverse_bits());
        assert_eq!(&key[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn long_password_truncates_to_eight_bytes() {
        assert_eq!(derive_key("longpassword"), derive_key("longpass"));
        assert_ne!(derive_key("longpass"), derive_key("longpasX"));
    }

    #[test]
    fn client_and_server_transforms_agree() {
        let challenge = [0xa5u8; 16];
        let auth = VncAuth::new(Some("secret".to_string()));
        let response = encrypt_challenge(&challenge, "secret");
        assert!(auth.verify_response(&response, &challenge));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let challenge = [0x3cu8; 16];
        let auth = VncAuth::new(Some("secret".to_string()));
        let response = encrypt_challenge(&challenge, "wrong");
        assert!(!auth.verify_response(&response, &challenge));
    }

    #[test]
    fn missing_password_rejects_everything() {
        let challenge = [0u8; 16];
        let auth = VncAuth::new(None);
        let response = encrypt_challenge(&challenge, "");
        assert!(!auth.verify_response(&response, &challenge));
        assert!(!auth.enabled());
    }

    #[test]
    fn blocks_encrypt_independently() {
        // ECB: identical 8-byte halves produce identical ciphertext halves.
        let challenge = [7u8; 16];
        let response = encrypt_challenge(&challenge, "pw");
        assert_eq!(&response[..8], &response[8..]);
        // And the transform is not the identity.
        assert_ne!(&response[..8], &challenge[..8]);
    }

    #[test]
    fn malformed_response_length_is_rejected() {
        let challenge = [1u8; 16];
        let auth = VncAuth::new(Some("pw".to_string()));
        assert!(!auth.verify_response(&[0u8; 8], &challenge));
    }
}
