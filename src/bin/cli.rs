//! relaychat CLI tool
//!
//! Manages the local identity and runs an in-process demonstration of the
//! friend handshake over a simulated relay.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use relaychat::{
    config::DEFAULT_RSA_BITS, Fingerprint, FriendRequestEngine, Identity, MemoryFriendStore,
    MemoryRelay, NotificationEvent, NotificationQueue, RequestOutcome, Session, SessionConfig, Uid,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// How long the demo waits for each handshake step
const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// relaychat: friend authentication over an untrusted relay
#[derive(Parser)]
#[command(name = "relaychat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to identity file (default: ~/.relaychat/identity.json)
    #[arg(short, long)]
    identity: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity keypair
    Init {
        /// Username to register with the relay
        #[arg(short, long)]
        username: String,

        /// RSA modulus size
        #[arg(short, long, default_value_t = DEFAULT_RSA_BITS)]
        bits: usize,

        /// Force overwrite existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Display your identity and public key
    Identity,

    /// Print the uid the relay uses for a username
    Uid {
        /// Username to hash
        username: String,
    },

    /// Run a friend handshake between two local users
    Demo {
        /// Session config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// On-disk identity
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityFile {
    username: String,
    private_key_pem: String,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let identity_path = cli.identity.unwrap_or_else(default_identity_path);

    match cli.command {
        Commands::Init {
            username,
            bits,
            force,
        } => cmd_init(&identity_path, &username, bits, force),
        Commands::Identity => cmd_identity(&identity_path),
        Commands::Uid { username } => cmd_uid(&username),
        Commands::Demo { config } => cmd_demo(config.as_deref()),
    }
}

fn init_logging() {
    let filter = match "relaychat=info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn default_identity_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| {
            eprintln!("Error: Could not find home directory; pass --identity");
            std::process::exit(1);
        })
        .join(".relaychat")
        .join("identity.json")
}

fn load_identity(path: &Path) -> Identity {
    let json = fs::read_to_string(path).unwrap_or_else(|_| {
        eprintln!("Error: No identity found at {:?}", path);
        eprintln!("Run 'relaychat init' to create one.");
        std::process::exit(1);
    });

    let file: IdentityFile = serde_json::from_str(&json).unwrap_or_else(|e| {
        eprintln!("Error: Invalid identity file: {}", e);
        std::process::exit(1);
    });

    Identity::from_pkcs8_pem(&file.username, &file.private_key_pem).unwrap_or_else(|e| {
        eprintln!("Error: Invalid identity key: {}", e);
        std::process::exit(1);
    })
}

fn save_identity(identity: &Identity, path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap_or_else(|e| {
            eprintln!("Error creating directory: {}", e);
            std::process::exit(1);
        });
    }

    let pem = identity.to_pkcs8_pem().unwrap_or_else(|e| {
        eprintln!("Error encoding identity: {}", e);
        std::process::exit(1);
    });
    let file = IdentityFile {
        username: identity.username().to_string(),
        private_key_pem: pem.to_string(),
    };
    let json = serde_json::to_string_pretty(&file).unwrap_or_else(|e| {
        eprintln!("Error encoding identity: {}", e);
        std::process::exit(1);
    });

    fs::write(path, json.as_bytes()).unwrap_or_else(|e| {
        eprintln!("Error saving identity: {}", e);
        std::process::exit(1);
    });
}

fn print_identity(identity: &Identity) {
    println!("Username:    {}", identity.username());
    println!("Uid:         {}", identity.uid());
    println!("Fingerprint: {}", identity.fingerprint());
    println!();
    println!("Public key (base64):");
    println!("{}", STANDARD.encode(identity.public_key().to_wire()));
}

fn cmd_init(path: &Path, username: &str, bits: usize, force: bool) {
    if path.exists() && !force {
        eprintln!("Identity already exists at {:?}", path);
        eprintln!("Use --force to overwrite.");
        std::process::exit(1);
    }

    println!("Generating {}-bit RSA key, this can take a moment...", bits);
    let identity = Identity::generate(username, bits).unwrap_or_else(|e| {
        eprintln!("Error generating identity: {}", e);
        std::process::exit(1);
    });
    save_identity(&identity, path);

    println!("Identity created successfully!");
    println!();
    print_identity(&identity);
    println!();
    println!("Identity saved to: {:?}", path);
    println!();
    println!("Friends compare the fingerprint above out of band before adding you.");
}

fn cmd_identity(path: &Path) {
    let identity = load_identity(path);
    print_identity(&identity);
}

fn cmd_uid(username: &str) {
    println!("{}", Uid::from_username(username));
}

fn load_config(path: Option<&Path>) -> SessionConfig {
    let Some(path) = path else {
        return SessionConfig::default();
    };
    SessionConfig::load(path).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    })
}

struct DemoClient {
    engine: Arc<FriendRequestEngine>,
    queue: Arc<NotificationQueue>,
}

fn connect(relay: &MemoryRelay, identity: Identity, config: &SessionConfig) -> DemoClient {
    let channel = relay.register(identity.username(), identity.public_key().clone());
    let queue = Arc::new(NotificationQueue::new());
    let session = Arc::new(Session::new(
        identity,
        config.clone(),
        Box::new(channel),
        Arc::new(MemoryFriendStore::new()),
        queue.clone(),
    ));
    let engine = FriendRequestEngine::start(session).unwrap_or_else(|e| {
        eprintln!("Error starting session: {}", e);
        std::process::exit(1);
    });
    DemoClient { engine, queue }
}

fn generate(username: &str, bits: usize) -> Identity {
    Identity::generate(username, bits).unwrap_or_else(|e| {
        eprintln!("Error generating identity: {}", e);
        std::process::exit(1);
    })
}

fn cmd_demo(config_path: Option<&Path>) {
    let config = load_config(config_path);

    println!("=== relaychat Demo ===");
    println!();
    println!("This demo shows the complete flow of:");
    println!("1. Identity generation");
    println!("2. Public key lookup and fingerprint confirmation");
    println!("3. Friend request and acceptance");
    println!("4. Shared key check");
    println!();

    // Step 1: Generate identities
    println!("--- Step 1: Identity Generation ---");
    let alice = generate("alice", config.rsa_bits);
    let bob = generate("bob", config.rsa_bits);
    let bob_fingerprint = bob.fingerprint();
    println!("Alice: uid {}", alice.uid());
    println!("Bob:   uid {}", bob.uid());
    println!();

    let relay = MemoryRelay::new();
    let alice = connect(&relay, alice, &config);
    let bob = connect(&relay, bob, &config);

    // Step 2: Lookup and fingerprint check
    println!("--- Step 2: Lookup and Fingerprint Check ---");
    let confirm = |username: &str, fingerprint: &Fingerprint| {
        println!("Relay returned a key for {}: {}", username, fingerprint);
        let matches = *fingerprint == bob_fingerprint;
        println!("Bob reads his fingerprint aloud... match: {}", matches);
        matches
    };
    match alice.engine.send_friend_request("bob", &confirm) {
        Ok(RequestOutcome::Sent) => println!("Alice sent a friend request to bob"),
        Ok(other) => {
            eprintln!("Friend request not sent: {:?}", other);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Friend request failed: {}", e);
            std::process::exit(1);
        }
    }
    println!();

    // Step 3: Bob accepts
    println!("--- Step 3: Friend Request and Acceptance ---");
    let pending = match bob.queue.wait_pop(DEMO_STEP_TIMEOUT) {
        Some(NotificationEvent::FriendRequest(pending)) => pending,
        other => {
            eprintln!("Bob expected a friend request, got {:?}", other);
            std::process::exit(1);
        }
    };
    println!(
        "Bob received a request from {} ({})",
        pending.username,
        pending.fingerprint()
    );
    bob.engine.session().acknowledge_notifications();

    let bob_side = bob.engine.accept(&pending).unwrap_or_else(|e| {
        eprintln!("Accept failed: {}", e);
        std::process::exit(1);
    });
    println!("Bob accepted and sent 128 bytes of key material");

    let alice_side = loop {
        match alice.queue.wait_pop(DEMO_STEP_TIMEOUT) {
            Some(NotificationEvent::FriendAdded(friend)) => break friend,
            Some(_) => continue,
            None => {
                eprintln!("Alice never received bob's response");
                std::process::exit(1);
            }
        }
    };
    alice.engine.session().acknowledge_notifications();
    println!("Alice stored {} as a friend", alice_side.username);
    println!();

    // Step 4: Key symmetry
    println!("--- Step 4: Shared Key Check ---");
    let a = &alice_side.keys;
    let b = &bob_side.keys;
    let symmetric = a.send_symm == b.recv_symm
        && a.recv_symm == b.send_symm
        && a.send_hmac == b.recv_hmac
        && a.recv_hmac == b.send_hmac;
    println!("Alice's send keys are Bob's receive keys: {}", symmetric);
    println!();

    alice.engine.session().shutdown();
    bob.engine.session().shutdown();

    if !symmetric {
        eprintln!("Key mismatch");
        std::process::exit(1);
    }
    println!("=== Demo Complete ===");
}
