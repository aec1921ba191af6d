/// Proxy configuration
///
/// Loaded from ./config.json. When the file is missing or unparsable the
/// configurator prompts once for a wallet address and writes a templated
/// config before continuing.

use std::io::Write;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const VERSION: &str = "1.0.0";
pub const USERAGENT: &str = "cnproxy/1.0.0";

/// Upper bound for one line-delimited JSON frame, both directions.
pub const MAX_REQUEST_SIZE: usize = 16 * 1024;

/// Deadline for every socket write. Also used for the first read on a new
/// miner connection, so miners that connect and stay silent are dropped fast.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for miner share-loop reads. Keepalives arrive well within this.
pub const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline for the pool's login response.
pub const LOGIN_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for pool job/response stream reads.
pub const POOL_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Rolling window for the average hashrate estimate.
pub const HASHRATE_AVG_MINUTES: u64 = 10;

/// Offset of the nonce byte rewritten per miner in the blockhashing blob.
pub const NONCE_OFFSET: usize = 42;

/// Blobs shorter than this cannot carry a nonce byte and are rejected.
pub const MIN_BLOB_LEN: usize = 44;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolEntry {
    pub url: String,
    #[serde(default)]
    pub tls: bool,
    /// Optional SHA-256 pin (64 hex chars) of the pool's TLS certificate.
    #[serde(default)]
    pub fingerprint: String,
    pub user: String,
    pub pass: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindEntry {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DashboardEntry {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub pools: Vec<PoolEntry>,
    pub bind: Vec<BindEntry>,
    pub print_interval: u16,
    #[serde(default)]
    pub interactive: bool,
    pub max_concurrency: usize,
    #[serde(default)]
    pub colors: bool,
    #[serde(default)]
    pub log_date: bool,
    #[serde(default)]
    pub title: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<DashboardEntry>,
}

pub const DEFAULT_CONFIG: &str = r#"{
	"pools": [
		{
			"url": "stratum.example.com:PORT_TLS",
			"tls": true,
			"user": "YOUR_WALLET_ADDRESS",
			"pass": "x"
		},
		{
			"url": "stratum.example.com:PORT_NO_TLS",
			"tls": false,
			"user": "YOUR_WALLET_ADDRESS",
			"pass": "x"
		}
	],
	"bind": [
		{
			"host": "0.0.0.0",
			"port": 3333,
			"tls": false
		},
		{
			"host": "0.0.0.0",
			"port": 3334,
			"tls": true
		}
	],
	"print_interval": 60,
	"interactive": true,
	"max_concurrency": 4,
	"colors": true,
	"log_date": true,
	"title": true,
	"verbose": false
}"#;

pub fn load() -> Result<Config> {
    let data = std::fs::read_to_string("./config.json").context("reading ./config.json")?;
    serde_json::from_str(&data).context("parsing ./config.json")
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            bail!("no pools defined");
        }
        for pool in &self.pools {
            if pool.url.is_empty() {
                bail!("invalid pool url");
            }
            if !pool.fingerprint.is_empty() {
                if pool.fingerprint.len() != 64 {
                    bail!("invalid SHA-256 TLS fingerprint length");
                }
                hex::decode(&pool.fingerprint)
                    .map_err(|_| anyhow!("invalid SHA-256 TLS fingerprint"))?;
            }
        }

        if self.bind.is_empty() {
            bail!("bind is empty");
        }
        for bind in &self.bind {
            if bind.host.is_empty() || bind.host.parse::<std::net::IpAddr>().is_err() {
                bail!("invalid bind host");
            }
            if bind.port == 0 {
                bail!("invalid bind port");
            }
        }
        if self.print_interval == 0 {
            bail!("invalid print interval");
        }
        if self.max_concurrency < 1 || self.max_concurrency > 128 {
            bail!("invalid max concurrency (should be between 1 and 128)");
        }
        Ok(())
    }
}

fn wallet_regexes() -> (Regex, Regex, Regex) {
    let word = Regex::new(r"^\w+$").unwrap();
    let xmr = Regex::new(r"^[48][0-9AB][1-9A-HJ-NP-Za-km-z]{93}$").unwrap();
    let zeph = Regex::new(r"^ZEPH[1-9A-HJ-NP-Za-km-z]+$").unwrap();
    (word, xmr, zeph)
}

/// Fill the default template for the given wallet address. Port defaults
/// follow the coin the address belongs to.
pub fn templated_config(address: &str) -> Result<String> {
    let (word, xmr, zeph) = wallet_regexes();

    if !word.is_match(address) {
        bail!("invalid address: {}", address);
    }

    let cfg = DEFAULT_CONFIG.replace("YOUR_WALLET_ADDRESS", address);
    let cfg = if xmr.is_match(address) {
        cfg.replace("PORT_TLS", "3334").replace("PORT_NO_TLS", "3333")
    } else if zeph.is_match(address) {
        cfg.replace("PORT_TLS", "5556").replace("PORT_NO_TLS", "5555")
    } else {
        cfg.replace("PORT_TLS", "3334").replace("PORT_NO_TLS", "3333")
    };
    Ok(cfg)
}

/// Prompt for a wallet address, write ./config.json from the template and
/// return the parsed result.
pub fn configurator() -> Result<Config> {
    let address = prompt("Enter your wallet address: ")?;
    println!("{}", address);

    let cfg = templated_config(&address)?;
    std::fs::write("./config.json", &cfg).context("writing ./config.json")?;
    serde_json::from_str(&cfg).context("parsing generated config")
}

fn prompt(label: &str) -> Result<String> {
    let mut line = String::new();
    loop {
        print!("{}", label);
        std::io::stdout().flush().ok();
        line.clear();
        std::io::stdin().read_line(&mut line)?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
}
