//! Password container and the pre-driver password policy.
//!
//! The driver enforces nothing about password quality; everything here
//! runs before a request is ever built. Buffers are zeroized on drop
//! and the mount path additionally wipes the wire copies after every
//! submission.

use zeroize::{Zeroize, Zeroizing};

use crate::error::{ControlError, ControlWarning, Result};

/// Minimum accepted password length in bytes.
pub const MIN_PASSWORD_LEN: usize = 1;
/// Maximum password length the wire format can carry.
pub const MAX_PASSWORD_LEN: usize = 64;
/// Below this length the password is accepted with a weakness warning.
pub const PASSWORD_WARNING_LEN: usize = 20;

/// An owned volume password. The backing buffer is wiped when the
/// value is dropped.
#[derive(Clone)]
pub struct Password(Zeroizing<Vec<u8>>);

impl Password {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_PASSWORD_LEN {
            return Err(ControlError::PasswordTooShort);
        }
        if bytes.len() > MAX_PASSWORD_LEN {
            return Err(ControlError::ParameterIncorrect);
        }
        Ok(Password(Zeroizing::new(bytes.to_vec())))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every byte is printable ASCII. Other passwords still
    /// mount, but are fragile across keyboard layouts.
    pub fn is_printable_ascii(&self) -> bool {
        self.0.iter().all(|&b| (0x20..0x7f).contains(&b))
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never echo the contents
        write!(f, "Password({} bytes)", self.0.len())
    }
}

/// Validate a new password against its confirmation.
///
/// Returns the weak-password warning when the pair is acceptable but
/// shorter than [`PASSWORD_WARNING_LEN`]. With key files enabled a
/// short (even empty) password is allowed, since the key files extend
/// the effective secret.
pub fn validate(
    password: &[u8],
    verify: &[u8],
    key_files_enabled: bool,
) -> Result<Option<ControlWarning>> {
    if password.len() != verify.len() {
        return Err(ControlError::PasswordLengthMismatch);
    }
    if password.len() < MIN_PASSWORD_LEN && !key_files_enabled {
        return Err(ControlError::PasswordTooShort);
    }
    if password != verify {
        return Err(ControlError::PasswordMismatch);
    }
    if password.len() < PASSWORD_WARNING_LEN {
        return Ok(Some(ControlWarning::WeakPassword));
    }
    Ok(None)
}

/// Fixed-size password block as it appears inside driver requests.
/// Length-prefixed, NUL-padded, 64-bit aligned.
#[derive(Clone)]
pub struct SecretBlock {
    pub len: u32,
    pub text: [u8; MAX_PASSWORD_LEN + 1],
}

impl SecretBlock {
    pub const WIRE_LEN: usize = 4 + MAX_PASSWORD_LEN + 1 + 3;

    pub fn empty() -> Self {
        SecretBlock { len: 0, text: [0u8; MAX_PASSWORD_LEN + 1] }
    }

    pub fn from_password(p: &Password) -> Self {
        let mut block = SecretBlock::empty();
        block.len = p.len() as u32;
        block.text[..p.len()].copy_from_slice(p.bytes());
        block
    }

    pub fn is_wiped(&self) -> bool {
        self.len == 0 && self.text.iter().all(|&b| b == 0)
    }
}

impl Zeroize for SecretBlock {
    fn zeroize(&mut self) {
        self.len.zeroize();
        self.text.zeroize();
    }
}

impl Drop for SecretBlock {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_lengths() {
        assert_eq!(Password::new(b"").unwrap_err(), ControlError::PasswordTooShort);
        assert_eq!(
            Password::new(&[b'x'; MAX_PASSWORD_LEN + 1]).unwrap_err(),
            ControlError::ParameterIncorrect
        );
        assert!(Password::new(b"x").is_ok());
    }

    #[test]
    fn validate_orders_checks_like_the_policy_says() {
        assert_eq!(
            validate(b"abc", b"abcd", false).unwrap_err(),
            ControlError::PasswordLengthMismatch
        );
        assert_eq!(validate(b"", b"", false).unwrap_err(), ControlError::PasswordTooShort);
        assert!(validate(b"", b"", true).is_ok());
        assert_eq!(
            validate(b"abc", b"abd", false).unwrap_err(),
            ControlError::PasswordMismatch
        );
    }

    #[test]
    fn short_passwords_warn_but_pass() {
        let warn = validate(b"short-password", b"short-password", false).unwrap();
        assert_eq!(warn, Some(ControlWarning::WeakPassword));
        let long = b"a-sufficiently-long-password";
        assert_eq!(validate(long, long, false).unwrap(), None);
    }

    #[test]
    fn secret_block_wipes_to_zero() {
        let pw = Password::new(b"hunter2hunter2").unwrap();
        let mut block = SecretBlock::from_password(&pw);
        assert!(!block.is_wiped());
        block.zeroize();
        assert!(block.is_wiped());
    }

    #[test]
    fn printable_ascii_check() {
        assert!(Password::new(b"plain ascii 123").unwrap().is_printable_ascii());
        assert!(!Password::new(&[0x01, 0x41]).unwrap().is_printable_ascii());
    }
}
