//! `lorekeep onboard`: First-time setup.

use lorekeep_config::EngineConfig;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = EngineConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("lorekeep — First-Time Setup");
    println!("===========================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("\nConfig already exists at: {}", config_path.display());
        println!("   Edit it manually or delete and re-run onboard.\n");
        return Ok(());
    }

    std::fs::write(&config_path, EngineConfig::default_toml())?;
    println!("Created config.toml at: {}", config_path.display());
    println!("\nNext steps:");
    println!("   1. Set LOREKEEP_API_KEY (or extraction.api_key) to enable fact extraction");
    println!("   2. Run: lorekeep ingest --kind backstory --owner <character> --user <user> backstory.txt");
    println!("   3. Run: lorekeep context --user <user> --character <character> -m \"hello\"\n");
    Ok(())
}
