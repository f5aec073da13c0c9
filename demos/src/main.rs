//! Barrier walkthrough
//!
//! Run with: `cargo run --bin barrier-demo`
//!
//! Walks through the full process lifecycle: share-based unseal, barrier
//! bootstrap, envelope encrypt/decrypt, rotation at every tier, a realm
//! creation, and session token issuance.

use barrier_core::app::{ApplicationCore, Config, UnsealModeConfig};
use barrier_crypto::unseal::shamir;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    println!("==================================================================");
    println!(" Barrier hierarchy walkthrough");
    println!("==================================================================");

    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("hash_pepper_v3"), b"pepper-bytes-thirty-two-long!!!").expect("write pepper");

    section("1. Split an unseal secret into 2-of-3 shares");
    let secret = [0x42u8; 32];
    let shares = shamir::split(&secret, 2, 3).expect("split");
    let share_dir = dir.path().join("shares");
    std::fs::create_dir_all(&share_dir).expect("mkdir");
    for (i, share) in shares.iter().enumerate() {
        std::fs::write(share_dir.join(format!("share-{i}.json")), share.to_bytes()).expect("write share");
    }
    println!("  wrote 3 share files to {}", share_dir.display());
    println!("  only 2 of the 3 are needed to reconstruct the unseal key");
    // Drop share-1 to prove the missing-share case still boots.
    std::fs::remove_file(share_dir.join("share-1.json")).expect("remove share");

    section("2. Bootstrap the application core (create_if_empty = true)");
    let config = Config {
        db_url: "sqlite::memory:".to_string(),
        unseal_mode: UnsealModeConfig::SharedSecret { m: 2, share_dir: share_dir.clone() },
        hash_pepper_dir: dir.path().to_path_buf(),
        create_if_empty: true,
    };
    let core = ApplicationCore::bootstrap(config).await.expect("bootstrap");
    let status = core.status().await;
    println!("  root kid:         {}", status.root_kid);
    println!("  intermediate kid: {}", status.intermediate_kid);
    println!("  content kid:      {}", status.content_kid);

    section("3. Encrypt and decrypt under the active content key");
    let plaintext = b"a tenant's secret";
    let jwe = core.barrier.encrypt(plaintext).await.expect("encrypt");
    println!("  ciphertext: {}", jwe.as_str());
    let recovered = core.barrier.decrypt(&jwe).await.expect("decrypt");
    assert_eq!(recovered, plaintext);
    println!("  roundtrip: ok");

    section("4. Rotate the content key; old ciphertext stays decryptable");
    core.barrier.rotate_content().await.expect("rotate content");
    let still_works = core.barrier.decrypt(&jwe).await.expect("decrypt after rotation");
    assert_eq!(still_works, plaintext);
    println!("  content key rotated: {}", core.status().await.content_kid);
    println!("  pre-rotation ciphertext still decrypts: ok");

    section("5. Rotate intermediate, then root; same guarantee holds");
    core.barrier.rotate_intermediate().await.expect("rotate intermediate");
    core.barrier.rotate_root().await.expect("rotate root");
    let still_works = core.barrier.decrypt(&jwe).await.expect("decrypt after full rotation");
    assert_eq!(still_works, plaintext);
    println!("  intermediate kid: {}", core.status().await.intermediate_kid);
    println!("  root kid:         {}", core.status().await.root_kid);
    println!("  original ciphertext still decrypts: ok");

    section("6. Create a realm and issue a session token");
    let realm_id = Uuid::now_v7();
    let realm = core.realms.create(realm_id, "acme", Some("Acme Corp"), barrier_core::realm::Product::Cipher).await.expect("create realm");
    println!("  realm schema: {}", realm.schema_name);
    let subject = Uuid::now_v7();
    let token = core.sessions.issue_browser(subject, realm_id, realm_id).expect("issue token");
    let claims = core.sessions.validate(&token).expect("validate token");
    println!("  issued browser token for subject {}", claims.sub);
    println!("  validated: ok, expires at {}", claims.expires_at);

    println!("\nDone.");
}

fn section(title: &str) {
    println!("\n--- {title} ---");
}
