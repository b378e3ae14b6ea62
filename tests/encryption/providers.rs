//! Cross-provider interoperability and tamper detection.

use std::sync::Arc;

use colcrypt::crypto::utf16le;
use colcrypt::provider::DEFAULT_CSP_NAME;
use colcrypt::{
    AeadCellCipher, CertificateStore, CertificateStoreProvider, CspProvider, EncryptionType,
    ErrorKind, InMemoryKeyVault, KeyContainerStore, KeyStoreProvider, KeyVaultProvider,
    StoreLocation,
};

use crate::support::{cek, key_a, key_b, VAULT_URL};

// ============================================================================
// Helpers
// ============================================================================

struct Providers {
    certificate: CertificateStoreProvider,
    certificate_path: String,
    csp: CspProvider,
    csp_path: String,
    vault: KeyVaultProvider,
}

/// The same RSA key installed in all three stores.
fn providers_sharing_key_a() -> Providers {
    let certificates = Arc::new(CertificateStore::new());
    let certificate_path = certificates.import(StoreLocation::LocalMachine, key_a()).unwrap();

    let containers = Arc::new(KeyContainerStore::new());
    let csp_path = containers.import(DEFAULT_CSP_NAME, "PatientsCMK", key_a());

    let vault = Arc::new(InMemoryKeyVault::new());
    vault.import(VAULT_URL, key_a());

    Providers {
        certificate: CertificateStoreProvider::new(certificates),
        certificate_path,
        csp: CspProvider::new(containers),
        csp_path,
        vault: KeyVaultProvider::new(vault),
    }
}

// ============================================================================
// Round trips
// ============================================================================

#[tokio::test]
async fn cek_sealed_by_one_provider_opens_with_every_other() {
    let p = providers_sharing_key_a();
    let sealed: Vec<(&str, Vec<u8>)> = vec![
        (
            "certificate",
            p.certificate
                .encrypt_column_encryption_key(&p.certificate_path, "RSA_OAEP", &cek())
                .await
                .unwrap(),
        ),
        (
            "csp",
            p.csp
                .encrypt_column_encryption_key(&p.csp_path, "RSA_OAEP", &cek())
                .await
                .unwrap(),
        ),
        (
            "vault",
            p.vault
                .encrypt_column_encryption_key(VAULT_URL, "RSA-OAEP", &cek())
                .await
                .unwrap(),
        ),
    ];

    for (origin, encrypted) in &sealed {
        let via_certificate = p
            .certificate
            .decrypt_column_encryption_key(&p.certificate_path, "RSA_OAEP", encrypted)
            .await
            .unwrap();
        let via_csp = p
            .csp
            .decrypt_column_encryption_key(&p.csp_path, "RSA_OAEP", encrypted)
            .await
            .unwrap();
        let via_vault = p
            .vault
            .decrypt_column_encryption_key(VAULT_URL, "RSA_OAEP", encrypted)
            .await
            .unwrap();
        assert_eq!(via_certificate.as_slice(), cek().as_slice(), "sealed by {}", origin);
        assert_eq!(via_csp.as_slice(), cek().as_slice(), "sealed by {}", origin);
        assert_eq!(via_vault.as_slice(), cek().as_slice(), "sealed by {}", origin);
    }
}

#[tokio::test]
async fn envelope_records_lowercased_path() {
    let p = providers_sharing_key_a();
    let encrypted = p
        .certificate
        .encrypt_column_encryption_key(&p.certificate_path, "RSA_OAEP", &cek())
        .await
        .unwrap();

    let path = utf16le(&p.certificate_path.to_lowercase());
    assert_eq!(encrypted[0], 0x01);
    assert_eq!(u16::from_le_bytes([encrypted[1], encrypted[2]]) as usize, path.len());
    assert_eq!(u16::from_le_bytes([encrypted[3], encrypted[4]]), 256);
    assert_eq!(&encrypted[5..5 + path.len()], path.as_slice());
    assert_eq!(encrypted.len(), 5 + path.len() + 256 + 256);
}

#[test]
fn reference_cell_vector_decrypts() {
    let expected = hex::decode(
        "01ae1f161361afa57c281a6b11206a0dbd941559f238deb0470d8831a6912944927b09910a1c16d6afe449c306ce4e9c2f75294314f06ccbd68dcf8fdbc504b867a17e58d1561f2b48a1d5bfb68766b7b3",
    )
    .unwrap();
    let cipher = AeadCellCipher::new(&cek(), EncryptionType::Deterministic).unwrap();
    let plaintext = utf16le("Hello World");

    assert_eq!(cipher.encrypt(&plaintext).unwrap(), expected);
    assert_eq!(cipher.decrypt(&expected).unwrap(), plaintext);
}

// ============================================================================
// Tamper detection
// ============================================================================

#[tokio::test]
async fn cek_from_another_master_key_fails_signature_check() {
    let p = providers_sharing_key_a();
    let encrypted = p
        .certificate
        .encrypt_column_encryption_key(&p.certificate_path, "RSA_OAEP", &cek())
        .await
        .unwrap();

    let containers = Arc::new(KeyContainerStore::new());
    let other_path = containers.import(DEFAULT_CSP_NAME, "OtherCMK", key_b());
    let other = CspProvider::new(containers);

    let err = other
        .decrypt_column_encryption_key(&other_path, "RSA_OAEP", &encrypted)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.to_string().starts_with(
        "The specified encrypted column encryption key signature does not match the signature computed with the column master key (asymmetric key)"
    ));
}

#[tokio::test]
async fn every_flipped_byte_of_the_envelope_is_rejected() {
    let p = providers_sharing_key_a();
    let encrypted = p
        .vault
        .encrypt_column_encryption_key(VAULT_URL, "RSA_OAEP", &cek())
        .await
        .unwrap();

    for index in (0..encrypted.len()).step_by(37) {
        let mut tampered = encrypted.clone();
        tampered[index] ^= 0x80;
        let result = p
            .certificate
            .decrypt_column_encryption_key(&p.certificate_path, "RSA_OAEP", &tampered)
            .await;
        let err = result.expect_err("tampered envelope must not open");
        assert_eq!(err.kind(), ErrorKind::Integrity, "byte {}", index);
    }
}

#[tokio::test]
async fn master_key_metadata_signature_is_portable_and_tamper_evident() {
    let p = providers_sharing_key_a();
    let signature = p
        .vault
        .sign_column_master_key_metadata(VAULT_URL, false)
        .await
        .unwrap();
    assert!(p
        .vault
        .verify_column_master_key_metadata(VAULT_URL, false, &signature)
        .await
        .unwrap());

    let mut tampered = signature.clone();
    tampered[10] ^= 0x01;
    assert!(!p
        .vault
        .verify_column_master_key_metadata(VAULT_URL, false, &tampered)
        .await
        .unwrap());

    // The provider name is part of the signed message.
    assert!(!p
        .certificate
        .verify_column_master_key_metadata(&p.certificate_path, false, &signature)
        .await
        .unwrap());
}
