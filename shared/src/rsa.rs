//! Raw (unpadded) RSA over the 128-byte handshake block.
//!
//! The client encrypts the block with the public exponent; the server
//! decrypts in place and requires the first clear byte to be zero before it
//! trusts the session key that follows.

use crate::error::{Result, WireError};
use crate::RSA_BLOCK_SIZE;
use num_bigint::BigUint;

pub const PUBLIC_EXPONENT: u32 = 65537;

/// The 1024-bit key every stock client ships with.
pub const DEFAULT_MODULUS: &str = "109120132967399429278860960508995541528237502902798129123468757937266291492576446330739696001110603907230888610072655818825358503429057592827629436413108566029093628212635953836686562675849720620786279431090218017681061521755056710823876476444260558147179707119674283982419152118103759076030616683978566631413";
pub const DEFAULT_PRIVATE_EXPONENT: &str = "46730330223584118622160180015036832148732986808519344675210555262940258739805766860224610646919605860206328024326703361630109888417839241959507572247284807035235569619173792292786907845791904955103601652822519121908367187885509270025388641700821735345222087940578381210879116823013776808975766851829020659073";

#[derive(Debug, Clone)]
pub struct RsaKey {
    modulus: BigUint,
    public_exponent: BigUint,
    private_exponent: Option<BigUint>,
}

impl RsaKey {
    /// Builds a full key pair from decimal strings.
    pub fn from_decimal(modulus: &str, private_exponent: &str) -> Result<Self> {
        let mut key = Self::public_from_decimal(modulus)?;
        key.private_exponent = Some(parse_decimal(private_exponent, "private exponent")?);
        Ok(key)
    }

    /// Builds an encrypt-only key, as a client holds it.
    pub fn public_from_decimal(modulus: &str) -> Result<Self> {
        let modulus = parse_decimal(modulus, "modulus")?;
        if modulus.bits() != (RSA_BLOCK_SIZE * 8) as u64 {
            return Err(WireError::InvalidKey(format!(
                "modulus is {} bits, expected {}",
                modulus.bits(),
                RSA_BLOCK_SIZE * 8
            )));
        }

        Ok(Self {
            modulus,
            public_exponent: BigUint::from(PUBLIC_EXPONENT),
            private_exponent: None,
        })
    }

    pub fn has_private_key(&self) -> bool {
        self.private_exponent.is_some()
    }

    /// Big-endian modulus, left padded to the block size.
    pub fn modulus_bytes(&self) -> Vec<u8> {
        to_block(&self.modulus)
    }

    pub fn encrypt(&self, block: &mut [u8]) -> Result<()> {
        self.transform(block, &self.public_exponent)
    }

    pub fn decrypt(&self, block: &mut [u8]) -> Result<()> {
        let exponent = self
            .private_exponent
            .as_ref()
            .ok_or(WireError::MissingPrivateKey)?;
        self.transform(block, exponent)
    }

    /// Decrypts a handshake block and checks the leading zero byte.
    pub fn decrypt_checked(&self, block: &mut [u8]) -> Result<()> {
        self.decrypt(block)?;
        if block[0] != 0 {
            return Err(WireError::RsaIntegrity);
        }
        Ok(())
    }

    fn transform(&self, block: &mut [u8], exponent: &BigUint) -> Result<()> {
        if block.len() != RSA_BLOCK_SIZE {
            return Err(WireError::RsaBlockSize {
                expected: RSA_BLOCK_SIZE,
                got: block.len(),
            });
        }

        let input = BigUint::from_bytes_be(block);
        if input >= self.modulus {
            return Err(WireError::RsaOutOfRange);
        }

        let output = input.modpow(exponent, &self.modulus);
        block.copy_from_slice(&to_block(&output));
        Ok(())
    }
}

impl Default for RsaKey {
    fn default() -> Self {
        // Both constants are valid by construction.
        Self::from_decimal(DEFAULT_MODULUS, DEFAULT_PRIVATE_EXPONENT)
            .expect("built-in rsa key is valid")
    }
}

fn parse_decimal(value: &str, what: &str) -> Result<BigUint> {
    BigUint::parse_bytes(value.trim().as_bytes(), 10)
        .ok_or_else(|| WireError::InvalidKey(format!("{} is not a decimal number", what)))
}

fn to_block(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut block = vec![0u8; RSA_BLOCK_SIZE.saturating_sub(bytes.len())];
    block.extend_from_slice(&bytes);
    block
}
