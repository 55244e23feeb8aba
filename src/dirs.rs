use std::path::PathBuf;

/// Root directory for vault state: `$A3S_VAULT_HOME`, else `~/.a3s/vault`.
pub fn vault_home() -> PathBuf {
    if let Ok(home) = std::env::var("A3S_VAULT_HOME") {
        return PathBuf::from(home);
    }
    let base = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    base.join(".a3s").join("vault")
}

/// Default config file location.
pub fn config_path() -> PathBuf {
    vault_home().join("config.toml")
}

/// Default scratch directory for short-lived plaintext copies.
pub fn scratch_dir() -> PathBuf {
    vault_home().join("scratch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_vault_home_env_override() {
        std::env::set_var("A3S_VAULT_HOME", "/tmp/vault-test-home");
        assert_eq!(vault_home(), PathBuf::from("/tmp/vault-test-home"));
        assert_eq!(
            config_path(),
            PathBuf::from("/tmp/vault-test-home/config.toml")
        );
        assert_eq!(scratch_dir(), PathBuf::from("/tmp/vault-test-home/scratch"));
        std::env::remove_var("A3S_VAULT_HOME");
    }

    #[test]
    #[serial]
    fn test_vault_home_default_under_home() {
        std::env::remove_var("A3S_VAULT_HOME");
        let home = vault_home();
        assert!(home.ends_with(".a3s/vault"));
    }
}
