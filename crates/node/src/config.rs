//! Command-line and `dualchain.conf` parsing.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dualchain_chainstate::loader::{DEFAULT_CHECKBLOCKS, DEFAULT_CHECKLEVEL, MAX_CHECKLEVEL};
use dualchain_chainstate::params::{chain_params, Network};

use crate::datadir::ShutdownDirective;
use crate::logging;

pub const CONF_FILE_NAME: &str = "dualchain.conf";
const DEFAULT_DATA_DIR: &str = "data";

pub const MIN_PRUNE_TARGET_MIB: i64 = 550;
pub const DEFAULT_LIMIT_DESCENDANT_SIZE_KB: u64 = 101;
/// `maxmempool` must hold this many maximum-size descendant packages.
const MEMPOOL_DESCENDANT_MULTIPLIER: u64 = 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EraseMode {
    #[default]
    None,
    Transient,
    All,
}

impl EraseMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "transient" => Some(Self::Transient),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn directive(self) -> ShutdownDirective {
        ShutdownDirective {
            erase_transient: self != EraseMode::None,
            erase_chain_data: self == EraseMode::All,
        }
    }
}

/// Resolved `prune` setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PruneMode {
    Disabled,
    /// `prune=1`: block files may be pruned, but never automatically.
    Manual,
    TargetMib(u64),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub reindex: bool,
    pub reindex_chainstate: bool,
    pub resync_for_upgrade: bool,
    pub check_blocks: u32,
    pub check_level: u32,
    pub prune: i64,
    pub txindex: bool,
    /// `None` when neither the command line nor the conf file set a value.
    pub db_cache_mib: Option<u64>,
    pub max_connections: Option<usize>,
    pub max_mempool_mb: Option<u64>,
    pub limit_descendant_size_kb: u64,
    pub rpc_threads: Option<usize>,
    pub reverse_headers: Option<bool>,
    pub load_blocks: Vec<PathBuf>,
    pub persist_mempool: bool,
    pub stop_after_import: bool,
    pub listen: bool,
    pub binds: Vec<SocketAddr>,
    pub white_binds: Vec<SocketAddr>,
    pub port: u16,
    pub server: bool,
    pub rpc_addr: SocketAddr,
    pub disable_wallet: bool,
    pub print_to_console: bool,
    pub shrink_debug_file: bool,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub erase_on_shutdown: EraseMode,
    pub unsupported_conf_keys: Vec<String>,
}

pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

impl Config {
    /// Directory holding this network's files.
    pub fn network_data_dir(&self) -> PathBuf {
        match self.network.data_subdir() {
            Some(subdir) => self.data_dir.join(subdir),
            None => self.data_dir.clone(),
        }
    }

    pub fn prune_mode(&self) -> PruneMode {
        match self.prune {
            value if value <= 0 => PruneMode::Disabled,
            1 => PruneMode::Manual,
            value => PruneMode::TargetMib(value as u64),
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.prune_mode() != PruneMode::Disabled
    }

    /// Every address the node listens on, with whether peers on it are whitelisted.
    pub fn listen_addrs(&self) -> Vec<(SocketAddr, bool)> {
        let mut out: Vec<(SocketAddr, bool)> = Vec::new();
        out.extend(self.binds.iter().map(|addr| (*addr, false)));
        out.extend(self.white_binds.iter().map(|addr| (*addr, true)));
        if out.is_empty() {
            out.push((
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
                false,
            ));
        }
        out
    }

    pub fn bind_count(&self) -> usize {
        self.binds.len() + self.white_binds.len()
    }

    /// Rejects option combinations that cannot run together.
    pub fn validate(&self) -> Result<(), String> {
        if self.prune < 0 {
            return Err("Prune cannot be configured with a negative value.".to_string());
        }
        if self.prune > 1 && self.prune < MIN_PRUNE_TARGET_MIB {
            return Err(format!(
                "Prune configured below the minimum of {MIN_PRUNE_TARGET_MIB} MiB.  Please use a higher number."
            ));
        }
        if self.prune != 0 && self.txindex {
            return Err("Prune mode is incompatible with -txindex.".to_string());
        }
        if let Some(max_mempool_mb) = self.max_mempool_mb {
            let min_bytes = self
                .limit_descendant_size_kb
                .saturating_mul(1000)
                .saturating_mul(MEMPOOL_DESCENDANT_MULTIPLIER);
            if crate::mb_to_bytes(max_mempool_mb) < min_bytes {
                return Err(format!(
                    "-maxmempool must be at least {} MB",
                    min_bytes.div_ceil(1_000_000)
                ));
            }
        }
        if self.check_level > MAX_CHECKLEVEL {
            return Err(format!(
                "-checklevel must be between 0 and {MAX_CHECKLEVEL} (got {})",
                self.check_level
            ));
        }
        Ok(())
    }
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Main;
    let mut network_set = false;
    let mut reindex = false;
    let mut reindex_set = false;
    let mut reindex_chainstate = false;
    let mut reindex_chainstate_set = false;
    let mut resync_for_upgrade = false;
    let mut resync_for_upgrade_set = false;
    let mut check_blocks: Option<u32> = None;
    let mut check_level: Option<u32> = None;
    let mut prune: Option<i64> = None;
    let mut txindex: Option<bool> = None;
    let mut db_cache_mib: Option<u64> = None;
    let mut max_connections: Option<usize> = None;
    let mut max_mempool_mb: Option<u64> = None;
    let mut limit_descendant_size_kb: Option<u64> = None;
    let mut rpc_threads: Option<usize> = None;
    let mut reverse_headers: Option<bool> = None;
    let mut load_blocks: Vec<PathBuf> = Vec::new();
    let mut persist_mempool: Option<bool> = None;
    let mut stop_after_import: Option<bool> = None;
    let mut listen: Option<bool> = None;
    let mut binds: Vec<SocketAddr> = Vec::new();
    let mut white_binds: Vec<SocketAddr> = Vec::new();
    let mut port: Option<u16> = None;
    let mut server: Option<bool> = None;
    let mut rpc_bind: Option<String> = None;
    let mut rpc_port: Option<u16> = None;
    let mut disable_wallet: Option<bool> = None;
    let mut print_to_console: Option<bool> = None;
    let mut shrink_debug_file: Option<bool> = None;
    let mut log_level: Option<logging::Level> = None;
    let mut log_format: Option<logging::Format> = None;
    let mut log_timestamps: Option<bool> = None;
    let mut erase_on_shutdown: Option<EraseMode> = None;
    let mut raw_binds: Vec<String> = Vec::new();
    let mut raw_white_binds: Vec<String> = Vec::new();
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }

    while let Some(arg) = args.next() {
        let mut next_value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for --{name}\n{}", usage()))
        };
        match arg.as_str() {
            "--backend" => {
                let value = next_value("backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--datadir" | "--data-dir" => data_dir = Some(PathBuf::from(next_value("datadir")?)),
            "--conf" => conf_path = Some(PathBuf::from(next_value("conf")?)),
            "--testnet" => {
                network = Network::Test;
                network_set = true;
            }
            "--regtest" => {
                network = Network::Regtest;
                network_set = true;
            }
            "--reindex" => {
                reindex = true;
                reindex_set = true;
            }
            "--reindex-chainstate" => {
                reindex_chainstate = true;
                reindex_chainstate_set = true;
            }
            "--resyncforblockindexupgrade" => {
                resync_for_upgrade = true;
                resync_for_upgrade_set = true;
            }
            "--checkblocks" => check_blocks = Some(parse_cli("checkblocks", &next_value("checkblocks")?)?),
            "--checklevel" => check_level = Some(parse_cli("checklevel", &next_value("checklevel")?)?),
            "--prune" => prune = Some(parse_cli("prune", &next_value("prune")?)?),
            "--txindex" => txindex = Some(true),
            "--no-txindex" => txindex = Some(false),
            "--dbcache" => db_cache_mib = Some(parse_cli("dbcache", &next_value("dbcache")?)?),
            "--maxconnections" => {
                max_connections = Some(parse_cli("maxconnections", &next_value("maxconnections")?)?)
            }
            "--maxmempool" => max_mempool_mb = Some(parse_cli("maxmempool", &next_value("maxmempool")?)?),
            "--limitdescendantsize" => {
                limit_descendant_size_kb =
                    Some(parse_cli("limitdescendantsize", &next_value("limitdescendantsize")?)?)
            }
            "--rpcthreads" => rpc_threads = Some(parse_cli("rpcthreads", &next_value("rpcthreads")?)?),
            "--reverseheaders" => reverse_headers = Some(true),
            "--no-reverseheaders" => reverse_headers = Some(false),
            "--loadblock" => load_blocks.push(PathBuf::from(next_value("loadblock")?)),
            "--persistmempool" => persist_mempool = Some(true),
            "--no-persistmempool" => persist_mempool = Some(false),
            "--stopafterblockimport" => stop_after_import = Some(true),
            "--listen" => listen = Some(true),
            "--no-listen" => listen = Some(false),
            "--bind" => raw_binds.push(next_value("bind")?),
            "--whitebind" => raw_white_binds.push(next_value("whitebind")?),
            "--port" => port = Some(parse_cli("port", &next_value("port")?)?),
            "--server" => server = Some(true),
            "--no-server" => server = Some(false),
            "--rpcbind" => rpc_bind = Some(next_value("rpcbind")?),
            "--rpcport" => rpc_port = Some(parse_cli("rpcport", &next_value("rpcport")?)?),
            "--disablewallet" => disable_wallet = Some(true),
            "--printtoconsole" => print_to_console = Some(true),
            "--shrinkdebugfile" => shrink_debug_file = Some(true),
            "--no-shrinkdebugfile" => shrink_debug_file = Some(false),
            "--log-level" => {
                let value = next_value("log-level")?;
                log_level = Some(
                    logging::Level::parse(&value)
                        .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?,
                );
            }
            "--log-format" => {
                let value = next_value("log-format")?;
                log_format = Some(
                    logging::Format::parse(&value)
                        .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?,
                );
            }
            "--log-timestamps" => log_timestamps = Some(true),
            "--no-log-timestamps" => log_timestamps = Some(false),
            "--erase-on-shutdown" => {
                let value = next_value("erase-on-shutdown")?;
                erase_on_shutdown = Some(EraseMode::parse(&value).ok_or_else(|| {
                    format!(
                        "invalid erase-on-shutdown '{value}' (expected none|transient|all)\n{}",
                        usage()
                    )
                })?);
            }
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let mut unsupported_conf_keys: Vec<String> = Vec::new();

    if let Some(conf) = load_conf(&conf_file)? {
        let conf = ConfFile {
            values: &conf,
            path: &conf_file,
        };
        if !network_set {
            if conf.flag("regtest")? == Some(true) {
                network = Network::Regtest;
            } else if conf.flag("testnet")? == Some(true) {
                network = Network::Test;
            }
        }
        if !backend_set {
            if let Some(raw) = conf.last("backend") {
                backend = Backend::parse(raw)
                    .ok_or_else(|| format!("invalid backend '{raw}' in {}", conf_file.display()))?;
            }
        }
        if !reindex_set {
            reindex = conf.flag("reindex")?.unwrap_or(reindex);
        }
        if !reindex_chainstate_set {
            reindex_chainstate = conf.flag("reindex-chainstate")?.unwrap_or(reindex_chainstate);
        }
        if !resync_for_upgrade_set {
            resync_for_upgrade =
                conf.flag("resyncforblockindexupgrade")?.unwrap_or(resync_for_upgrade);
        }
        fill(&mut check_blocks, conf.number("checkblocks")?);
        fill(&mut check_level, conf.number("checklevel")?);
        fill(&mut prune, conf.number("prune")?);
        fill(&mut txindex, conf.flag("txindex")?);
        fill(&mut db_cache_mib, conf.number("dbcache")?);
        fill(&mut max_connections, conf.number("maxconnections")?);
        fill(&mut max_mempool_mb, conf.number("maxmempool")?);
        fill(&mut limit_descendant_size_kb, conf.number("limitdescendantsize")?);
        fill(&mut rpc_threads, conf.number("rpcthreads")?);
        fill(&mut reverse_headers, conf.flag("reverseheaders")?);
        fill(&mut persist_mempool, conf.flag("persistmempool")?);
        fill(&mut stop_after_import, conf.flag("stopafterblockimport")?);
        fill(&mut listen, conf.flag("listen")?);
        fill(&mut port, conf.number("port")?);
        fill(&mut server, conf.flag("server")?);
        fill(&mut rpc_port, conf.number("rpcport")?);
        fill(&mut disable_wallet, conf.flag("disablewallet")?);
        fill(&mut print_to_console, conf.flag("printtoconsole")?);
        fill(&mut shrink_debug_file, conf.flag("shrinkdebugfile")?);
        fill(&mut log_timestamps, conf.flag("log-timestamps")?);
        if load_blocks.is_empty() {
            load_blocks.extend(conf.all("loadblock").iter().map(PathBuf::from));
        }
        if raw_binds.is_empty() {
            raw_binds.extend(conf.all("bind").iter().cloned());
        }
        if raw_white_binds.is_empty() {
            raw_white_binds.extend(conf.all("whitebind").iter().cloned());
        }
        if rpc_bind.is_none() {
            rpc_bind = conf.last("rpcbind").map(str::to_string);
        }
        if log_level.is_none() {
            if let Some(raw) = conf.last("log-level") {
                log_level = Some(logging::Level::parse(raw).ok_or_else(|| {
                    format!("invalid log-level '{raw}' in {}", conf_file.display())
                })?);
            }
        }
        if log_format.is_none() {
            if let Some(raw) = conf.last("log-format") {
                log_format = Some(logging::Format::parse(raw).ok_or_else(|| {
                    format!("invalid log-format '{raw}' in {}", conf_file.display())
                })?);
            }
        }
        if erase_on_shutdown.is_none() {
            if let Some(raw) = conf.last("erase-on-shutdown") {
                erase_on_shutdown = Some(EraseMode::parse(raw).ok_or_else(|| {
                    format!("invalid erase-on-shutdown '{raw}' in {}", conf_file.display())
                })?);
            }
        }

        let supported_keys = [
            "backend",
            "bind",
            "checkblocks",
            "checklevel",
            "dbcache",
            "disablewallet",
            "erase-on-shutdown",
            "limitdescendantsize",
            "listen",
            "loadblock",
            "log-format",
            "log-level",
            "log-timestamps",
            "maxconnections",
            "maxmempool",
            "persistmempool",
            "port",
            "printtoconsole",
            "prune",
            "regtest",
            "reindex",
            "reindex-chainstate",
            "resyncforblockindexupgrade",
            "reverseheaders",
            "rpcbind",
            "rpcport",
            "rpcthreads",
            "server",
            "shrinkdebugfile",
            "stopafterblockimport",
            "testnet",
            "txindex",
            "whitebind",
        ];
        let mut unsupported: Vec<String> = conf
            .values
            .keys()
            .filter(|key| !supported_keys.contains(&key.as_str()))
            .cloned()
            .collect();
        unsupported.sort();
        unsupported_conf_keys = unsupported;
    }

    let params = chain_params(network);
    let port = port.unwrap_or(params.default_port);
    for raw in raw_binds {
        binds.push(
            parse_socket_addr_with_default_port(&raw, port)
                .ok_or_else(|| format!("invalid bind '{raw}'\n{}", usage()))?,
        );
    }
    for raw in raw_white_binds {
        white_binds.push(
            parse_socket_addr_with_default_port(&raw, port)
                .ok_or_else(|| format!("invalid whitebind '{raw}'\n{}", usage()))?,
        );
    }
    let rpc_port = rpc_port.unwrap_or(params.rpc_port);
    let rpc_addr = match rpc_bind {
        Some(raw) => parse_socket_addr_with_default_port(&raw, rpc_port)
            .ok_or_else(|| format!("invalid rpcbind '{raw}'\n{}", usage()))?,
        None => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), rpc_port),
    };

    Ok(CliAction::Run(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        reindex,
        reindex_chainstate,
        resync_for_upgrade,
        check_blocks: check_blocks.unwrap_or(DEFAULT_CHECKBLOCKS),
        check_level: check_level.unwrap_or(DEFAULT_CHECKLEVEL),
        prune: prune.unwrap_or(0),
        txindex: txindex.unwrap_or(false),
        db_cache_mib,
        max_connections,
        max_mempool_mb,
        limit_descendant_size_kb: limit_descendant_size_kb
            .unwrap_or(DEFAULT_LIMIT_DESCENDANT_SIZE_KB),
        rpc_threads,
        reverse_headers,
        load_blocks,
        persist_mempool: persist_mempool.unwrap_or(true),
        stop_after_import: stop_after_import.unwrap_or(false),
        listen: listen.unwrap_or(true),
        binds,
        white_binds,
        port,
        server: server.unwrap_or(true),
        rpc_addr,
        disable_wallet: disable_wallet.unwrap_or(false),
        print_to_console: print_to_console.unwrap_or(false),
        shrink_debug_file: shrink_debug_file.unwrap_or(true),
        log_level: log_level.unwrap_or(logging::Level::Info),
        log_format: log_format.unwrap_or(logging::Format::Text),
        log_timestamps: log_timestamps.unwrap_or(true),
        erase_on_shutdown: erase_on_shutdown.unwrap_or_default(),
        unsupported_conf_keys,
    }))
}

struct ConfFile<'a> {
    values: &'a HashMap<String, Vec<String>>,
    path: &'a Path,
}

impl<'a> ConfFile<'a> {
    fn last(&self, key: &str) -> Option<&'a str> {
        self.values
            .get(key)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    fn all(&self, key: &str) -> &'a [String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, String> {
        let Some(raw) = self.last(key) else {
            return Ok(None);
        };
        parse_conf_bool(raw)
            .map(Some)
            .ok_or_else(|| format!("invalid {key} value '{raw}' in {}", self.path.display()))
    }

    fn number<T: FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        let Some(raw) = self.last(key) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid {key} '{raw}' in {}", self.path.display()))
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn parse_cli<T: FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("invalid {name} '{value}'\n{}", usage()))
}

/// Reads `name=value` lines. `#` and `;` start comments, keys are lowercased, and a
/// bare key stands for `1`. `Ok(None)` when the file does not exist.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        let key = key.to_ascii_lowercase();
        out.entry(key).or_default().push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_socket_addr_with_default_port(value: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    None
}

pub fn usage() -> String {
    [
        "Usage:",
        "  dualchaind [options]",
        "  dualchaind <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --datadir <dir>  Base data directory (default: ./data)",
        "  --conf <file>  Config file path (default: <datadir>/dualchain.conf)",
        "  --testnet  Use the test network",
        "  --regtest  Use the regression test network",
        "  --backend <fjall|memory>  Storage backend (default: fjall)",
        "  --reindex  Rebuild the block index and chain state from blocks/blk*.dat",
        "  --reindex-chainstate  Rebuild the chain state from the existing block index",
        "  --resyncforblockindexupgrade  Reindex instead of upgrading a legacy block index in place",
        "  --checkblocks <n>  How many blocks to verify at startup (default: 6, 0 = all)",
        "  --checklevel <0-4>  How thorough the startup verification is (default: 3)",
        "  --prune <MiB>  Prune block files down to this target (0 = off, 1 = manual, >= 550)",
        "  --txindex  Maintain a full transaction index",
        "  --dbcache <MiB>  Total database cache size (4..16384, default: 450)",
        "  --maxconnections <n>  Maximum peer connections (default: 125)",
        "  --maxmempool <MB>  Mempool memory limit (default: 300)",
        "  --limitdescendantsize <kB>  Largest descendant package kept in the mempool (default: 101)",
        "  --rpcthreads <n>  RPC worker count (default: 4)",
        "  --reverseheaders, --no-reverseheaders  Toggle reverse-order header sync",
        "  --loadblock <file>  Import blocks from an external blk file (repeatable)",
        "  --persistmempool, --no-persistmempool  Save the mempool on shutdown and reload it on start (default: on)",
        "  --stopafterblockimport  Shut down once the block import finishes",
        "  --listen, --no-listen  Accept incoming connections (default: on)",
        "  --bind <addr>  Listen on this address (repeatable)",
        "  --whitebind <addr>  Listen on this address and whitelist its peers (repeatable)",
        "  --port <port>  Listen port (default: network specific)",
        "  --server, --no-server  Run the JSON-RPC control endpoint (default: on)",
        "  --rpcbind <addr>  RPC listen address (default: 127.0.0.1)",
        "  --rpcport <port>  RPC port (default: network specific)",
        "  --disablewallet  Do not load the wallet",
        "  --printtoconsole  Log to stderr instead of debug.log",
        "  --shrinkdebugfile, --no-shrinkdebugfile  Trim debug.log on startup (default: on)",
        "  --log-level <level>  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format <format>  Log output format (text|json) (default: text)",
        "  --log-timestamps, --no-log-timestamps  Timestamps in text logs (default: on)",
        "  --erase-on-shutdown <none|transient|all>  Remove data when shutting down (default: none)",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(args: &[&str]) -> Config {
        match parse_args_from(args.iter().map(|arg| arg.to_string())).expect("parse") {
            CliAction::Run(config) => config,
            _ => panic!("expected a run action"),
        }
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(["help".to_string()]),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(["--version".to_string()]),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn command_line_beats_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# node settings\nregtest=1\ndbcache=300\nmaxconnections=12 ; inline\ntxindex\nloadblock=a.dat\nloadblock=b.dat\nfoo=bar\n",
        )
        .expect("write conf");
        let datadir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--datadir", &datadir, "--dbcache", "64"]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.db_cache_mib, Some(64));
        assert_eq!(config.max_connections, Some(12));
        assert!(config.txindex);
        assert_eq!(
            config.load_blocks,
            vec![PathBuf::from("a.dat"), PathBuf::from("b.dat")]
        );
        assert_eq!(config.unsupported_conf_keys, vec!["foo".to_string()]);
        assert_eq!(config.port, chain_params(Network::Regtest).default_port);
    }

    #[test]
    fn unset_resource_options_stay_unset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let datadir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--datadir", &datadir]);
        assert_eq!(config.db_cache_mib, None);
        assert_eq!(config.max_connections, None);
        assert_eq!(config.max_mempool_mb, None);
        assert_eq!(config.rpc_threads, None);
        assert_eq!(config.reverse_headers, None);
    }

    #[test]
    fn conf_bool_accepts_words_and_bare_keys() {
        assert_eq!(parse_conf_bool(""), Some(true));
        assert_eq!(parse_conf_bool("Yes"), Some(true));
        assert_eq!(parse_conf_bool("0"), Some(false));
        assert_eq!(parse_conf_bool("maybe"), None);
    }

    #[test]
    fn unknown_argument_and_bad_values_are_rejected() {
        let err = parse_args_from(["--frobnicate".to_string()])
            .err()
            .expect("unknown argument");
        assert!(err.starts_with("unknown argument '--frobnicate'"));
        assert!(parse_args_from(["--dbcache".to_string(), "lots".to_string()]).is_err());
        assert!(parse_args_from(["--prune".to_string()]).is_err());
    }

    #[test]
    fn parameter_interactions_are_checked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let datadir = dir.path().to_string_lossy().to_string();

        let config = run_config(&["--datadir", &datadir, "--prune", "600", "--txindex"]);
        assert!(config.validate().unwrap_err().contains("incompatible with -txindex"));

        let config = run_config(&["--datadir", &datadir, "--prune", "-5"]);
        assert!(config.validate().unwrap_err().contains("negative"));

        let config = run_config(&["--datadir", &datadir, "--prune", "100"]);
        assert!(config.validate().unwrap_err().contains("minimum of 550"));

        let config = run_config(&["--datadir", &datadir, "--prune", "1"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.prune_mode(), PruneMode::Manual);

        let config = run_config(&["--datadir", &datadir, "--maxmempool", "3"]);
        assert_eq!(
            config.validate().unwrap_err(),
            "-maxmempool must be at least 5 MB"
        );

        let config = run_config(&["--datadir", &datadir, "--checklevel", "5"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_listen_address_uses_network_port() {
        let dir = tempfile::tempdir().expect("tempdir");
        let datadir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--datadir", &datadir, "--testnet"]);
        let addrs = config.listen_addrs();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].0.port(), chain_params(Network::Test).default_port);
        assert_eq!(config.network_data_dir(), dir.path().join("testnet3"));

        let config = run_config(&[
            "--datadir",
            &datadir,
            "--bind",
            "127.0.0.1",
            "--whitebind",
            "127.0.0.1:9999",
        ]);
        assert_eq!(config.bind_count(), 2);
        assert!(config.listen_addrs()[1].1);
    }
}
