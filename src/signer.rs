//! JAR signing of the final bundle, and removal of stale signatures.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, info};
use pkcs8::EncryptedPrivateKeyInfo;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{PaddingScheme, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::android::zip::Archive;
use crate::error::{BundleError, BundleResult};

type Certificate = rasn_pkix::Certificate;

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
const CREATED_BY: &str = concat!("reschiper ", env!("CARGO_PKG_VERSION"));
const MAX_LINE: usize = 72;

/// The password Android debug keystores are created with.
pub const DEBUG_KEYSTORE_PASSWORD: &str = "android";

const OID_SIGNED_DATA: &[u8] = &[0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
const OID_DATA: &[u8] = &[0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];
const OID_SHA256: &[u8] = &[0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
const OID_RSA_ENCRYPTION: &[u8] = &[0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
const DER_NULL: &[u8] = &[0x05, 0x00];

/// Keystore location and secrets, all resolved up front.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyStoreCredentials {
    pub store_path: PathBuf,
    pub store_password: String,
    pub key_alias: String,
    pub key_password: String,
}

impl KeyStoreCredentials {
    /// All four absent means "unsigned"; a partial set is an error.
    pub fn resolve(
        store_path: Option<PathBuf>,
        store_password: Option<String>,
        key_alias: Option<String>,
        key_password: Option<String>,
    ) -> BundleResult<Option<Self>> {
        let store_password = store_password.filter(|s| !s.is_empty());
        let key_alias = key_alias.filter(|s| !s.is_empty());
        let key_password = key_password.filter(|s| !s.is_empty());
        match (store_path, store_password, key_alias, key_password) {
            (None, None, None, None) => Ok(None),
            (Some(store_path), Some(store_password), Some(key_alias), Some(key_password)) => {
                Ok(Some(KeyStoreCredentials {
                    store_path,
                    store_password,
                    key_alias,
                    key_password,
                }))
            }
            (store_path, store_password, key_alias, key_password) => {
                let missing: Vec<&str> = [
                    ("store path", store_path.is_none()),
                    ("store password", store_password.is_none()),
                    ("key alias", key_alias.is_none()),
                    ("key password", key_password.is_none()),
                ]
                .into_iter()
                .filter(|(_, absent)| *absent)
                .map(|(name, _)| name)
                .collect();
                Err(BundleError::SigningError(format!(
                    "incomplete signing credentials, missing {}",
                    missing.join(", ")
                )))
            }
        }
    }
}

impl fmt::Debug for KeyStoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStoreCredentials")
            .field("store_path", &self.store_path)
            .field("store_password", &mask(Some(self.store_password.as_str())))
            .field("key_alias", &mask(Some(self.key_alias.as_str())))
            .field("key_password", &mask(Some(self.key_password.as_str())))
            .finish()
    }
}

/// Keep the first half of a secret, `****` for the rest; `/` when absent.
pub fn mask(value: Option<&str>) -> String {
    match value {
        None => "/".to_string(),
        Some(value) if value.chars().count() <= 2 => "****".to_string(),
        Some(value) => {
            let keep = value.chars().count() / 2;
            format!("{}****", value.chars().take(keep).collect::<String>())
        }
    }
}

/// Whether `name` is signature metadata a transformation invalidates.
pub fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper == "MANIFEST.MF" || [".SF", ".RSA", ".DSA", ".EC"].iter().any(|ext| upper.ends_with(ext))
}

/// Remove every signature file, returning how many were dropped.
pub fn strip_signatures(archive: &mut Archive) -> usize {
    let stale: Vec<String> = archive
        .entry_names()
        .filter(|name| is_signature_file(name))
        .map(str::to_string)
        .collect();
    for name in &stale {
        debug!("Removing stale signature file {name}");
        archive.remove_entry(name);
    }
    stale.len()
}

#[derive(Clone)]
pub struct JarSigner {
    key: RsaPrivateKey,
    pubkey: RsaPublicKey,
    cert: Certificate,
    cert_der: Vec<u8>,
    alias: String,
}

impl JarSigner {
    /// Load a PEM keystore holding one private key and its certificate.
    ///
    /// An `ENCRYPTED PRIVATE KEY` is decrypted with `password`. A plaintext key only
    /// opens with [`DEBUG_KEYSTORE_PASSWORD`].
    pub fn from_pem(pem: &str, alias: &str, password: &str) -> BundleResult<Self> {
        let blocks = pem::parse_many(pem)
            .map_err(|err| BundleError::SigningError(format!("keystore is not PEM: {err}")))?;
        let find = |tag: &str| blocks.iter().find(|block| block.tag == tag);
        let key = if let Some(block) = find("ENCRYPTED PRIVATE KEY") {
            let info = EncryptedPrivateKeyInfo::try_from(block.contents.as_slice())
                .map_err(|err| BundleError::SigningError(format!("invalid encrypted private key: {err}")))?;
            let document = info.decrypt(password).map_err(|_| {
                BundleError::SigningError(format!("wrong key password for alias {alias}"))
            })?;
            RsaPrivateKey::from_pkcs8_der(document.as_bytes())
                .map_err(|err| BundleError::SigningError(format!("invalid private key: {err}")))?
        } else {
            if password != DEBUG_KEYSTORE_PASSWORD {
                return Err(BundleError::SigningError(format!(
                    "keystore key for alias {alias} is not encrypted, it only opens with the debug password"
                )));
            }
            if let Some(block) = find("PRIVATE KEY") {
                RsaPrivateKey::from_pkcs8_der(&block.contents)
                    .map_err(|err| BundleError::SigningError(format!("invalid private key: {err}")))?
            } else if let Some(block) = find("RSA PRIVATE KEY") {
                RsaPrivateKey::from_pkcs1_der(&block.contents)
                    .map_err(|err| BundleError::SigningError(format!("invalid private key: {err}")))?
            } else {
                return Err(BundleError::SigningError("no private key in keystore".to_string()));
            }
        };
        let cert_der = blocks
            .iter()
            .find(|block| block.tag == "CERTIFICATE")
            .map(|block| block.contents.clone())
            .ok_or_else(|| BundleError::SigningError("no certificate in keystore".to_string()))?;
        let cert = rasn::der::decode::<Certificate>(&cert_der)
            .map_err(|err| BundleError::SigningError(format!("invalid certificate: {err}")))?;
        let pubkey = RsaPublicKey::from(&key);
        Ok(JarSigner {
            key,
            pubkey,
            cert,
            cert_der,
            alias: signature_name(alias),
        })
    }

    pub fn load(credentials: &KeyStoreCredentials) -> BundleResult<Self> {
        let pem = fs::read_to_string(&credentials.store_path).map_err(|err| {
            BundleError::SigningError(format!(
                "cannot read keystore {}: {err}",
                credentials.store_path.display()
            ))
        })?;
        // a PEM keystore has a single secret, as PKCS#12 stores do
        if credentials.store_password != credentials.key_password {
            return Err(BundleError::SigningError(
                "store and key passwords differ, a PEM keystore has a single password".to_string(),
            ));
        }
        JarSigner::from_pem(&pem, &credentials.key_alias, &credentials.key_password)
    }

    pub fn pubkey(&self) -> &RsaPublicKey {
        &self.pubkey
    }

    /// Base name of the `.SF`/`.RSA` pair.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    fn sign(&self, bytes: &[u8]) -> BundleResult<Vec<u8>> {
        let digest = Sha256::digest(bytes);
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        self.key
            .sign(padding, &digest)
            .map_err(|err| BundleError::SigningError(format!("RSA signing failed: {err}")))
    }

    /// Replace any signature with `MANIFEST.MF`, `<ALIAS>.SF` and `<ALIAS>.RSA`.
    pub fn sign_archive(&self, archive: &mut Archive) -> BundleResult<usize> {
        strip_signatures(archive);
        let names: Vec<String> = archive.entry_names().map(str::to_string).collect();

        let mut manifest = main_section(&[("Manifest-Version", "1.0"), ("Created-By", CREATED_BY)]);
        let main_attributes = manifest.clone();
        let mut sections = Vec::with_capacity(names.len());
        for name in &names {
            let data = archive.read_entry(name)?;
            let digest = STANDARD.encode(Sha256::digest(&data));
            let mut section = Vec::new();
            write_header(&mut section, "Name", name);
            write_header(&mut section, "SHA-256-Digest", &digest);
            section.extend_from_slice(b"\r\n");
            manifest.extend_from_slice(&section);
            sections.push((name, section));
        }

        let main_digest = STANDARD.encode(Sha256::digest(&main_attributes));
        let manifest_digest = STANDARD.encode(Sha256::digest(&manifest));
        let mut sf = main_section(&[
            ("Signature-Version", "1.0"),
            ("SHA-256-Digest-Manifest-Main-Attributes", main_digest.as_str()),
            ("SHA-256-Digest-Manifest", manifest_digest.as_str()),
            ("Created-By", CREATED_BY),
        ]);
        for (name, section) in &sections {
            write_header(&mut sf, "Name", name);
            write_header(&mut sf, "SHA-256-Digest", &STANDARD.encode(Sha256::digest(section)));
            sf.extend_from_slice(b"\r\n");
        }

        let signature = self.sign(&sf)?;
        let block = self.signature_block(&signature)?;

        archive.replace_entry(MANIFEST_PATH, manifest)?;
        archive.replace_entry(format!("META-INF/{}.SF", self.alias), sf)?;
        archive.replace_entry(format!("META-INF/{}.RSA", self.alias), block)?;
        info!("Signed {} entries as {}", names.len(), self.alias);
        Ok(names.len())
    }

    /// PKCS#7 `ContentInfo` wrapping a detached `SignedData` with one signer.
    fn signature_block(&self, signature: &[u8]) -> BundleResult<Vec<u8>> {
        let issuer = rasn::der::encode(&self.cert.tbs_certificate.issuer)
            .map_err(|err| BundleError::SigningError(format!("cannot encode issuer: {err}")))?;
        let serial = rasn::der::encode(&self.cert.tbs_certificate.serial_number)
            .map_err(|err| BundleError::SigningError(format!("cannot encode serial number: {err}")))?;
        let sha256 = der(0x30, &[OID_SHA256, DER_NULL].concat());
        let rsa = der(0x30, &[OID_RSA_ENCRYPTION, DER_NULL].concat());
        let version = der(0x02, &[0x01]);

        let signer_info = der(
            0x30,
            &[
                version.as_slice(),
                &der(0x30, &[issuer, serial].concat()),
                &sha256,
                &rsa,
                &der(0x04, signature),
            ]
            .concat(),
        );
        let signed_data = der(
            0x30,
            &[
                version.as_slice(),
                &der(0x31, &sha256),
                &der(0x30, OID_DATA),
                &der(0xa0, &self.cert_der),
                &der(0x31, &signer_info),
            ]
            .concat(),
        );
        Ok(der(0x30, &[OID_SIGNED_DATA, &der(0xa0, &signed_data)].concat()))
    }
}

impl fmt::Debug for JarSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JarSigner")
            .field("alias", &self.alias)
            .field("pubkey", &self.pubkey)
            .finish_non_exhaustive()
    }
}

/// jarsigner's rule: at most 8 characters of `A-Z0-9_-`, anything else becomes `_`.
fn signature_name(alias: &str) -> String {
    let name: String = alias
        .chars()
        .take(8)
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_' | '-') => c,
            _ => '_',
        })
        .collect();
    if name.is_empty() {
        "CERT".to_string()
    } else {
        name
    }
}

fn main_section(headers: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers {
        write_header(&mut out, name, value);
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// One `Name: value` header, wrapped at 72 bytes with single-space continuation lines.
fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{name}: {value}");
    let bytes = line.as_bytes();
    let mut start = 0;
    let mut limit = MAX_LINE;
    while bytes.len() - start > limit {
        let mut end = start + limit;
        // never split a UTF-8 sequence
        while end > start && !line.is_char_boundary(end) {
            end -= 1;
        }
        out.extend_from_slice(&bytes[start..end]);
        out.extend_from_slice(b"\r\n ");
        start = end;
        limit = MAX_LINE - 1;
    }
    out.extend_from_slice(&bytes[start..]);
    out.extend_from_slice(b"\r\n");
}

/// A DER TLV with definite length.
fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{DEBUG_PEM, ENCRYPTED_DEBUG_PASSWORD, ENCRYPTED_DEBUG_PEM};
    use rsa::PublicKey;

    #[test]
    fn partial_credentials_are_an_error() {
        assert!(KeyStoreCredentials::resolve(None, None, None, None).unwrap().is_none());
        let err = KeyStoreCredentials::resolve(
            Some(PathBuf::from("release.pem")),
            Some("secret".to_string()),
            None,
            Some(String::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("key alias, key password"), "{err}");
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask(None), "/");
        assert_eq!(mask(Some("ab")), "****");
        assert_eq!(mask(Some("android")), "and****");
        let credentials = KeyStoreCredentials {
            store_path: PathBuf::from("debug.pem"),
            store_password: "android".to_string(),
            key_alias: "androiddebugkey".to_string(),
            key_password: "android".to_string(),
        };
        assert!(!format!("{credentials:?}").contains("android\""));
    }

    #[test]
    fn long_headers_wrap_at_72_bytes() {
        let mut out = Vec::new();
        write_header(&mut out, "Name", &"x".repeat(100));
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 72);
        assert!(lines[1].starts_with(' '));
        assert_eq!(lines[0].len() + lines[1].len() - 1, "Name: ".len() + 100);
    }

    #[test]
    fn signature_files_are_recognized() {
        assert!(is_signature_file("META-INF/MANIFEST.MF"));
        assert!(is_signature_file("META-INF/CERT.RSA"));
        assert!(is_signature_file("META-INF/key0.sf"));
        assert!(!is_signature_file("META-INF/services/java.sql.Driver"));
        assert!(!is_signature_file("res/META-INF/CERT.RSA"));
    }

    #[test]
    fn alias_becomes_jarsigner_name() {
        assert_eq!(signature_name("androiddebugkey"), "ANDROIDD");
        assert_eq!(signature_name("my key"), "MY_KEY");
        assert_eq!(signature_name(""), "CERT");
    }

    #[test]
    fn signs_and_verifies() {
        let signer = JarSigner::from_pem(DEBUG_PEM, "release", DEBUG_KEYSTORE_PASSWORD).unwrap();
        let mut archive = Archive::new();
        archive.replace_entry("AndroidManifest.xml", b"manifest".to_vec()).unwrap();
        archive.replace_entry("META-INF/OLD.RSA", b"stale".to_vec()).unwrap();
        assert_eq!(signer.sign_archive(&mut archive).unwrap(), 1);
        assert!(!archive.contains("META-INF/OLD.RSA"));

        let manifest = String::from_utf8(archive.read_entry(MANIFEST_PATH).unwrap()).unwrap();
        let digest = STANDARD.encode(Sha256::digest(b"manifest"));
        assert!(manifest.contains(&format!("Name: AndroidManifest.xml\r\nSHA-256-Digest: {digest}\r\n")));

        let sf = archive.read_entry("META-INF/RELEASE.SF").unwrap();
        let block = archive.read_entry("META-INF/RELEASE.RSA").unwrap();
        assert_eq!(block[0], 0x30);
        let signature = &block[block.len() - 256..];
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        signer
            .pubkey()
            .verify(padding, &Sha256::digest(&sf), signature)
            .unwrap();
    }

    #[test]
    fn encrypted_keys_open_with_their_password() {
        let signer = JarSigner::from_pem(ENCRYPTED_DEBUG_PEM, "release", ENCRYPTED_DEBUG_PASSWORD).unwrap();
        let plain = JarSigner::from_pem(DEBUG_PEM, "release", DEBUG_KEYSTORE_PASSWORD).unwrap();
        assert_eq!(signer.pubkey(), plain.pubkey());

        let err = JarSigner::from_pem(ENCRYPTED_DEBUG_PEM, "release", "also-wrong").unwrap_err();
        assert!(err.to_string().contains("wrong key password"), "{err}");
    }

    #[test]
    fn plaintext_keys_need_the_debug_password() {
        let err = JarSigner::from_pem(DEBUG_PEM, "release", "definitely-wrong").unwrap_err();
        assert!(matches!(err, BundleError::SigningError(_)));
    }

    #[test]
    fn store_and_key_passwords_must_agree() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("release.pem");
        fs::write(&store_path, ENCRYPTED_DEBUG_PEM).unwrap();
        let mut credentials = KeyStoreCredentials {
            store_path,
            store_password: ENCRYPTED_DEBUG_PASSWORD.to_string(),
            key_alias: "release".to_string(),
            key_password: ENCRYPTED_DEBUG_PASSWORD.to_string(),
        };
        assert!(JarSigner::load(&credentials).is_ok());
        credentials.store_password = "definitely-wrong".to_string();
        let err = JarSigner::load(&credentials).unwrap_err();
        assert!(err.to_string().contains("passwords differ"), "{err}");
    }
}
