//! Dump queue command implementation.

use super::{open_store, CliResult, OutputFormat};
use calsync_core::store::{decode_row, MUTATIONS};
use calsync_core::{DurableStore, Mutation, Sequence};
use std::path::Path;

/// Runs the dump-queue command.
pub fn run(path: &Path, limit: Option<usize>, format: OutputFormat) -> CliResult<()> {
    let store = open_store(path)?;
    let mutations = read_queue(&store, limit)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&mutations)?);
        }
        OutputFormat::Text => print_text_output(&mutations),
    }
    Ok(())
}

/// Reads pending mutations in sequence order.
pub fn read_queue(store: &DurableStore, limit: Option<usize>) -> CliResult<Vec<Mutation>> {
    if !store.has_table(MUTATIONS) {
        return Ok(Vec::new());
    }

    let mut mutations = Vec::new();
    for (key, value) in store.scan(MUTATIONS)? {
        if limit.is_some_and(|limit| mutations.len() >= limit) {
            break;
        }
        let mutation: Mutation = decode_row(&value)?;
        if Sequence::from_key(&key) != Some(mutation.sequence) {
            return Err(format!(
                "mutation row {:?} holds {}",
                key, mutation.sequence
            )
            .into());
        }
        mutations.push(mutation);
    }
    Ok(mutations)
}

fn print_text_output(mutations: &[Mutation]) {
    if mutations.is_empty() {
        println!("Queue is empty");
        return;
    }

    println!(
        "{:<10} {:<16} {:<36} {:>8} {:>9}  {}",
        "SEQUENCE", "KIND", "ENTITY", "ATTEMPTS", "CONFLICTS", "NEXT ATTEMPT (ms)"
    );
    for m in mutations {
        println!(
            "{:<10} {:<16} {:<36} {:>8} {:>9}  {}",
            m.sequence.as_u64(),
            m.kind.as_str(),
            m.entity_id.to_string(),
            m.attempt_count,
            m.conflicts,
            m.next_attempt_at
        );
        for (field, value) in &m.payload {
            println!("           {field} = {value}");
        }
    }
    println!();
    println!("{} mutation(s)", mutations.len());
}
