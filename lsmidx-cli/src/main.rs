//! lsmidx CLI - build, query and merge LSM indexes from the shell

use anyhow::{bail, Context, Result};
use lsmidx_core::index::IndexEngine;
use lsmidx_core::{HeapRef, HeapSource, IndexEntry, IndexKey, RowRef, UniqueCheck};
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Heap source backed by a TSV file: key, value, page, slot per line
struct FileHeap {
    name: String,
    rows: Vec<IndexEntry>,
}

impl FileHeap {
    fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("heap")
            .to_string();

        let content =
            fs::read_to_string(path).with_context(|| format!("reading heap file {:?}", path))?;

        let mut rows = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 4 {
                bail!("line {}: expected 4 tab-separated fields", lineno + 1);
            }
            let page: u32 = fields[2]
                .parse()
                .with_context(|| format!("line {}: bad page", lineno + 1))?;
            let slot: u16 = fields[3]
                .parse()
                .with_context(|| format!("line {}: bad slot", lineno + 1))?;
            rows.push(IndexEntry::new(fields[0], fields[1], RowRef::new(page, slot)));
        }

        Ok(Self { name, rows })
    }
}

impl HeapSource for FileHeap {
    fn heap_ref(&self) -> HeapRef {
        HeapRef::new(self.name.clone())
    }

    fn scan(
        &self,
    ) -> lsmidx_core::Result<Box<dyn Iterator<Item = lsmidx_core::Result<IndexEntry>> + '_>> {
        Ok(Box::new(self.rows.iter().cloned().map(Ok)))
    }
}

fn usage() -> ! {
    eprintln!("lsmidx {}", lsmidx_core::VERSION);
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  lsmidx build  <dir> <index> <heap.tsv>          bulk-build from a heap file");
    eprintln!("  lsmidx insert <dir> <index> <key> <value> <page> <slot> [--unique]");
    eprintln!("  lsmidx lookup <dir> <index> <key>               rows under a key");
    eprintln!("  lsmidx scan   <dir> <index>                     full ordered scan");
    eprintln!("  lsmidx merge  <dir> <index>                     merge the top into the base");
    eprintln!("  lsmidx stats  <dir> <index>                     structure ids and counters");
    eprintln!("  lsmidx list   <dir>                             loaded indexes");
    eprintln!("  lsmidx drop   <dir> <index>                     delete an index");
    std::process::exit(2);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        usage();
    }

    let command = args[0].as_str();
    let engine = IndexEngine::open(&args[1])?;

    match command {
        "build" => {
            if args.len() != 4 {
                usage();
            }
            let heap = FileHeap::load(Path::new(&args[3]))?;
            let rows = heap.rows.len();
            engine.create_index(&args[2], &heap)?;
            println!("built index {:?} over {} rows", args[2], rows);
        }
        "insert" => {
            if args.len() < 7 {
                usage();
            }
            let unique = args.get(7).map(|a| a == "--unique").unwrap_or(false);
            let page: u32 = args[5].parse().context("bad page")?;
            let slot: u16 = args[6].parse().context("bad slot")?;

            let index = engine.get_index(&args[2])?;
            let inserted = index.insert(
                args[3].as_str(),
                args[4].as_str(),
                RowRef::new(page, slot),
                if unique {
                    UniqueCheck::Enforce
                } else {
                    UniqueCheck::No
                },
            )?;
            println!("{}", if inserted { "inserted" } else { "already present" });
        }
        "lookup" => {
            if args.len() != 4 {
                usage();
            }
            let index = engine.get_index(&args[2])?;
            let rows = index.lookup(&IndexKey::from(args[3].as_str()))?;
            for (row, value) in rows {
                println!("{}\t{}", row, String::from_utf8_lossy(&value));
            }
        }
        "scan" => {
            if args.len() != 3 {
                usage();
            }
            let index = engine.get_index(&args[2])?;
            for entry in index.scan_all()? {
                println!(
                    "{}\t{}\t{}",
                    entry.key,
                    String::from_utf8_lossy(&entry.value),
                    entry.row
                );
            }
        }
        "merge" => {
            if args.len() != 3 {
                usage();
            }
            let ran = engine.merge_index(&args[2])?;
            println!("{}", if ran { "merged" } else { "merge already running" });
        }
        "stats" => {
            if args.len() != 3 {
                usage();
            }
            let stats = engine.index_stats(&args[2])?;
            let out = serde_json::json!({
                "heap": stats.heap,
                "base_id": stats.base_id,
                "top_id": stats.top_id,
                "sealed_top_id": stats.sealed_top_id,
                "insert_count": stats.insert_count,
                "epoch": stats.epoch,
                "base_entries": stats.base_entries,
                "top_entries": stats.top_entries,
                "sealed_entries": stats.sealed_entries,
                "merge_phase": format!("{:?}", stats.merge_phase),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        "list" => {
            for name in engine.list_indexes() {
                println!("{}", name);
            }
        }
        "drop" => {
            if args.len() != 3 {
                usage();
            }
            engine.drop_index(&args[2])?;
            println!("dropped index {:?}", args[2]);
        }
        _ => usage(),
    }

    Ok(())
}
