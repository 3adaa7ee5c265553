//! NAS Security Key Refresh
//!
//! Next-hop derivation used by the path switch (TS 33.401 Annex A.4).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::context::SecurityContext;
use crate::error::{MmeError, MmeResult};

/// FC value of the NH derivation
const FC_FOR_NH_ENB_DERIVATION: u8 = 0x12;

/// Key length of KASME, KeNB and NH
pub const SECURITY_KEY_LEN: usize = 32;

/// NCC is a 3-bit counter
const NCC_MASK: u8 = 0x07;

type HmacSha256 = Hmac<Sha256>;

/// KDF of TS 33.220 B.2.0 with a single parameter
fn kdf_single(key: &[u8], fc: u8, param: &[u8]) -> MmeResult<[u8; SECURITY_KEY_LEN]> {
    let mut s = Vec::with_capacity(1 + param.len() + 2);
    s.push(fc);
    s.extend_from_slice(param);
    s.extend_from_slice(&(param.len() as u16).to_be_bytes());

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| MmeError::InvalidState(format!("kdf key rejected: {}", e)))?;
    mac.update(&s);

    let mut output = [0u8; SECURITY_KEY_LEN];
    output.copy_from_slice(&mac.finalize().into_bytes());
    Ok(output)
}

/// NH = KDF(KASME, FC=0x12, sync_input)
pub fn derive_nh(
    kasme: &[u8; SECURITY_KEY_LEN],
    sync_input: &[u8; SECURITY_KEY_LEN],
) -> MmeResult<[u8; SECURITY_KEY_LEN]> {
    kdf_single(kasme, FC_FOR_NH_ENB_DERIVATION, sync_input)
}

/// Initial NH after a KeNB was derived; NCC restarts at zero
pub fn init_next_hop(security: &mut SecurityContext) -> MmeResult<()> {
    security.nh = derive_nh(&security.kasme, &security.kenb)?;
    security.ncc = 0;
    Ok(())
}

/// Chain the next hop and bump NCC. Returns the pair in use before the refresh,
/// which is what the target eNB gets in the path switch acknowledge.
pub fn advance_next_hop(security: &mut SecurityContext) -> MmeResult<([u8; SECURITY_KEY_LEN], u8)> {
    let current = (security.nh, security.ncc);
    security.nh = derive_nh(&security.kasme, &security.nh)?;
    security.ncc = (security.ncc + 1) & NCC_MASK;
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_nh_deterministic() {
        let kasme = [0x11u8; 32];
        let sync = [0x22u8; 32];
        let a = derive_nh(&kasme, &sync).unwrap();
        let b = derive_nh(&kasme, &sync).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, sync);
        assert_ne!(derive_nh(&[0x12u8; 32], &sync).unwrap(), a);
    }

    #[test]
    fn test_advance_next_hop_returns_previous() {
        let mut security = SecurityContext {
            kasme: [1u8; 32],
            kenb: [2u8; 32],
            ..Default::default()
        };
        init_next_hop(&mut security).unwrap();
        let first_nh = security.nh;

        let (nh, ncc) = advance_next_hop(&mut security).unwrap();
        assert_eq!(nh, first_nh);
        assert_eq!(ncc, 0);
        assert_eq!(security.ncc, 1);
        assert_eq!(security.nh, derive_nh(&[1u8; 32], &first_nh).unwrap());
    }

    #[test]
    fn test_ncc_wraps() {
        let mut security = SecurityContext {
            ncc: 7,
            ..Default::default()
        };
        advance_next_hop(&mut security).unwrap();
        assert_eq!(security.ncc, 0);
    }
}
