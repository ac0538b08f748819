use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey, signature::Signer, signature::Verifier};
use serde::{Serialize, de::DeserializeOwned};
use smol_str::SmolStr;

use super::{Error, jws::RegisteredHeader, jws::UntrustedHeader};

pub fn create_signed_jwt<C: Serialize>(
    key: &SigningKey,
    header: &RegisteredHeader,
    claims: &C,
) -> serde_json::Result<SmolStr> {
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_string(header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_string(claims)?);
    let signature: Signature = key.sign(format!("{header}.{payload}").as_bytes());
    Ok(smol_str::format_smolstr!(
        "{header}.{payload}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// A compact JWS split into its three segments. Nothing is verified on construction.
#[derive(Debug, Clone, Copy)]
pub struct CompactJws<'a> {
    signing_input: &'a str,
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
}

impl<'a> CompactJws<'a> {
    pub fn parse(token: &'a str) -> Result<Self, Error> {
        let mut parts = token.splitn(3, '.');
        let (Some(header), Some(payload), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Malformed);
        };
        if signature.contains('.') {
            return Err(Error::Malformed);
        }
        let signing_input = &token[..header.len() + 1 + payload.len()];
        Ok(Self {
            signing_input,
            header,
            payload,
            signature,
        })
    }

    pub fn header(&self) -> Result<UntrustedHeader, Error> {
        decode_segment(self.header)
    }

    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode_segment(self.payload)
    }

    pub fn signing_input(&self) -> &'a str {
        self.signing_input
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(URL_SAFE_NO_PAD.decode(self.signature)?)
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, Error> {
    let bytes = URL_SAFE_NO_PAD.decode(segment)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Check an ES256 signature over the token's signing input.
pub fn verify_es256(token: &CompactJws<'_>, key: &VerifyingKey) -> Result<(), Error> {
    let header = token.header()?;
    if header.alg != "ES256" {
        return Err(Error::UnsupportedAlgorithm(header.alg.to_string()));
    }
    let signature = Signature::from_slice(&token.signature_bytes()?)?;
    key.verify(token.signing_input().as_bytes(), &signature)?;
    Ok(())
}

/// Check an RS256 (RSASSA-PKCS1-v1_5 with SHA-256) signature over the token's signing input.
pub fn verify_rs256(token: &CompactJws<'_>, key: &rsa::RsaPublicKey) -> Result<(), Error> {
    let header = token.header()?;
    if header.alg != "RS256" {
        return Err(Error::UnsupportedAlgorithm(header.alg.to_string()));
    }
    let signature = rsa::pkcs1v15::Signature::try_from(token.signature_bytes()?.as_slice())?;
    rsa::pkcs1v15::VerifyingKey::<rsa::sha2::Sha256>::new(key.clone())
        .verify(token.signing_input().as_bytes(), &signature)?;
    Ok(())
}
