//! `lorekeep facts`: Inspect and correct learned facts.

use lorekeep_core::fact::{FactCandidate, FactType, FactWrite};

pub async fn list(user: &str, character: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let engine = super::open_engine(&config).await?;
    let facts = engine.get_user_facts(user, character).await?;

    if facts.is_empty() {
        println!("No facts recorded for {user}.");
        return Ok(());
    }

    println!("{} fact(s) for {user}:\n", facts.len());
    for fact in &facts {
        let scope = fact.character_id.as_deref().unwrap_or("global");
        println!(
            "  [{}] {:<12} {} = {}  ({scope}, {:.2})",
            fact.id, fact.fact_type.as_str(), fact.fact_key, fact.fact_value, fact.confidence
        );
    }
    Ok(())
}

pub async fn set(
    user: &str,
    character: Option<&str>,
    fact_type: &str,
    key: &str,
    value: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let fact_type = FactType::parse(fact_type).ok_or_else(|| format!("unknown fact type '{fact_type}'"))?;
    if key.trim().is_empty() || value.trim().is_empty() {
        return Err("fact key and value must not be empty".into());
    }

    let config = super::load_config()?;
    let engine = super::open_engine(&config).await?;
    match engine
        .remember_fact(user, character, FactCandidate::new(fact_type, key, value.trim()))
        .await?
    {
        FactWrite::Inserted(fact) => println!("Recorded {} = {} [{}]", fact.fact_key, fact.fact_value, fact.id),
        FactWrite::Updated { previous_value, fact } => {
            println!("Updated {}: {previous_value} → {}", fact.fact_key, fact.fact_value)
        }
    }
    Ok(())
}

pub async fn update(id: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let engine = super::open_engine(&config).await?;
    let fact = engine.update_fact(id, value).await?;
    println!("Updated {} = {}", fact.fact_key, fact.fact_value);
    Ok(())
}

pub async fn delete(id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let engine = super::open_engine(&config).await?;
    if engine.delete_fact(id).await? {
        println!("Deleted fact {id}");
    } else {
        println!("No active fact with id {id}");
    }
    Ok(())
}
