use std::net::SocketAddr;

const WAMETER_CONFIG: &str = "WAMETER_CONFIG";

const DEFAULT_CONFIG: &str = "./wameter.json";

pub fn get_config_path() -> String {
    std::env::var(WAMETER_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG.to_string())
}

const WAMETER_ADDR: &str = "WAMETER_ADDR";

pub fn get_addr() -> Option<SocketAddr> {
    let addr_from_env = std::env::var(WAMETER_ADDR);
    addr_from_env.ok().and_then(|res| res.parse().ok())
}

const WAMETER_STORAGE_DSN: &str = "WAMETER_STORAGE_DSN";

pub fn get_storage_dsn() -> Option<String> {
    let dsn_from_env = std::env::var(WAMETER_STORAGE_DSN);
    dsn_from_env.ok().filter(|dsn| !dsn.is_empty())
}

/// Human readable byte count, binary units
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_binary_units() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.50 KiB");
        assert_eq!(format_bytes(150.0 * 1024.0 * 1024.0), "150.00 MiB");
        assert_eq!(format_bytes(-3.0), "0 B");
    }
}
