//! Read-only companion tool: print selected sections of a backup
//! image.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use backup_image::catalog::{display_name, Catalog, CatalogItem, ItemRef};
use backup_image::stream::serialize::{self, Summary};
use backup_image::stream::{HeaderFlags, InputStream};
use backup_image::tools::display_bytes;

#[derive(Parser)]
#[command(
    name = "backup-image-dump",
    version,
    about = "Print the contents of a backup image"
)]
struct Args {
    /// Print counts of each item type
    #[arg(long)]
    catalog_summary: bool,

    /// Print all catalogue items
    #[arg(long)]
    catalog_details: bool,

    /// Print create statements from the metadata
    #[arg(long)]
    metadata_statements: bool,

    /// Print extra metadata blob sizes
    #[arg(long)]
    metadata_extra: bool,

    /// Print the snapshot descriptors
    #[arg(long)]
    snapshots: bool,

    /// Print per-chunk sizes
    #[arg(long)]
    data_chunks: bool,

    /// Print per-table data totals
    #[arg(long)]
    data_totals: bool,

    /// Print the summary section
    #[arg(long)]
    summary: bool,

    /// Everything except --snapshots and --data-chunks
    #[arg(long)]
    all: bool,

    /// Print byte counts in raw form, not humanized
    #[arg(long)]
    exact: bool,

    /// List items in image (emission) order
    #[arg(long)]
    image_order: bool,

    /// Find an object by name or db.name; SQL wildcards % and _ are
    /// recognized, quoting with ', " or `
    #[arg(long)]
    search: Option<String>,

    /// The backup image to read
    image: PathBuf,
}

struct ChunkStat {
    bytes: u64,
    chunks: u64,
    last_seen: bool,
}

struct ImageDump {
    catalog: Catalog,
    chunk_lines: Vec<String>,
    totals: BTreeMap<(u16, u32), ChunkStat>,
    summary: Summary,
}

fn read_image(path: &PathBuf, want_chunk_lines: bool, exact: bool) -> Result<ImageDump> {
    let mut inp = InputStream::open_read(path)
        .with_context(|| format!("cannot read image {}", path.display()))?;

    let header = serialize::read_header(&mut inp)?;
    let inline_summary = if header.flags.contains(HeaderFlags::INLINE_SUMMARY) {
        Some(serialize::read_summary(&mut inp)?)
    } else {
        None
    };

    let mut catalog = Catalog::from_header(header);
    serialize::read_catalogue(&mut inp, &mut catalog)?;
    serialize::read_meta_data(&mut inp, &mut catalog)?;
    catalog.close();

    let mut chunk_lines = Vec::new();
    let mut totals: BTreeMap<(u16, u32), ChunkStat> = BTreeMap::new();
    while let Some(chunk) = serialize::read_data_chunk(&mut inp)? {
        if want_chunk_lines {
            chunk_lines.push(format!(
                "snapshot {} stream {:<6} {:>12}{}",
                chunk.snap_num,
                chunk.table_num,
                display_bytes(chunk.data.len() as u64, exact),
                if chunk.last { "  LAST" } else { "" }
            ));
        }
        let stat = totals
            .entry((chunk.snap_num, chunk.table_num))
            .or_insert(ChunkStat { bytes: 0, chunks: 0, last_seen: false });
        stat.bytes += chunk.data.len() as u64;
        stat.chunks += 1;
        stat.last_seen |= chunk.last;
    }

    let summary = match inline_summary {
        Some(summary) => summary,
        None => serialize::read_summary(&mut inp)?,
    };

    Ok(ImageDump { catalog, chunk_lines, totals, summary })
}

fn item_location(cat: &Catalog, item_ref: ItemRef, item: &CatalogItem) -> String {
    let name = display_name(item.name()).into_owned();
    let db_name = |db: u16| {
        cat.get_db(db)
            .map(|d| display_name(&d.name).into_owned())
            .unwrap_or_else(|| format!("#{}", db))
    };
    match item_ref {
        ItemRef::Tablespace { .. } | ItemRef::Database { .. } => format!("`{}`", name),
        ItemRef::Table { snap_num, pos } => {
            let db = cat
                .get_table(snap_num, pos)
                .map(|t| db_name(t.db))
                .unwrap_or_default();
            format!("`{}`.`{}`", db, name)
        }
        ItemRef::DbObject { db, .. } | ItemRef::TableObject { db, .. } => {
            format!("`{}`.`{}`", db_name(db), name)
        }
    }
}

fn coordinate(item_ref: ItemRef) -> String {
    match item_ref {
        ItemRef::Tablespace { pos } | ItemRef::Database { pos } => format!("({})", pos),
        ItemRef::Table { snap_num, pos } => format!("({}, {})", snap_num, pos),
        ItemRef::DbObject { db, pos } => format!("({}, {})", db, pos),
        ItemRef::TableObject { db, table_pos, pos } => {
            format!("({}, {}, {})", db, table_pos, pos)
        }
    }
}

fn print_catalog_summary(cat: &Catalog) {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (_, item) in cat.image_order() {
        *counts.entry(item.item_type().describe()).or_insert(0) += 1;
    }
    println!("Catalogue summary:");
    println!("  {:<18} {}", "snapshots", cat.snap_count());
    for (what, count) in counts {
        println!("  {:<18} {}", what, count);
    }
}

fn print_catalog_details(cat: &Catalog) {
    println!("Catalogue items:");
    for (item_ref, item) in cat.image_order() {
        println!(
            "  {:<18} {:<12} {}",
            item.item_type().describe(),
            coordinate(item_ref),
            item_location(cat, item_ref, &item)
        );
    }
}

fn print_metadata(cat: &Catalog, statements: bool, extra: bool, exact: bool) {
    println!("Metadata:");
    for (item_ref, item) in cat.image_order() {
        let meta = match item.meta() {
            Some(meta) => meta,
            None => continue,
        };
        let place = item_location(cat, item_ref, &item);
        if statements && !meta.create_stmt.is_empty() {
            println!(
                "  {} {}: {}",
                item.item_type().describe(),
                place,
                String::from_utf8_lossy(&meta.create_stmt)
            );
        }
        if extra {
            println!(
                "  {} {}: {} extra bytes",
                item.item_type().describe(),
                place,
                display_bytes(meta.extra.len() as u64, exact)
            );
        }
    }
}

fn print_snapshots(cat: &Catalog) {
    println!("Snapshots:");
    for (idx, snap) in cat.snapshots().enumerate() {
        let descr = &snap.descr;
        let engine = match &descr.engine {
            Some(info) => format!(", engine {} {}.{}", info.name, info.major, info.minor),
            None => String::new(),
        };
        println!(
            "  #{} {} (version {}, {} tables{})",
            idx + 1,
            descr.name(),
            descr.version,
            descr.table_count,
            engine
        );
    }
}

fn print_data_totals(dump: &ImageDump, exact: bool) {
    println!("Data totals:");
    for ((snap, table), stat) in &dump.totals {
        let place = match dump.catalog.get_table(*snap, *table) {
            Some(t) => item_location(
                &dump.catalog,
                ItemRef::Table { snap_num: *snap, pos: *table },
                &CatalogItem::Table(t),
            ),
            None => format!("stream #{}", table),
        };
        println!(
            "  snapshot {} {:<30} {:>12} in {} chunks{}",
            snap,
            place,
            display_bytes(stat.bytes, exact),
            stat.chunks,
            if stat.last_seen { "" } else { "  (no LAST chunk)" }
        );
    }
}

fn print_summary(dump: &ImageDump, exact: bool) {
    let summary = &dump.summary;
    println!("Summary:");
    println!("  start time      {}", dump.catalog.header.start_time);
    println!("  end time        {}", summary.end_time);
    println!("  validity point  {}", summary.vp_time);
    match &summary.binlog_pos {
        Some(pos) => println!("  binlog          {} / {}", pos.file, pos.offset),
        None => println!("  binlog          (not recorded)"),
    }
    println!(
        "  table data      {} in {} chunks",
        display_bytes(summary.data_size, exact),
        summary.chunk_count
    );
    for (idx, bytes) in summary.snapshot_bytes.iter().enumerate() {
        println!("    snapshot {:<3} {}", idx + 1, display_bytes(*bytes, exact));
    }
}

fn print_image_order(cat: &Catalog) {
    println!("Image order:");
    for (idx, (item_ref, item)) in cat.image_order().into_iter().enumerate() {
        println!(
            "  {:<4} {:<18} {}",
            idx,
            item.item_type().describe(),
            item_location(cat, item_ref, &item)
        );
    }
}

/// Strip one level of SQL-style quoting from a search term.
fn unquote(term: &str) -> &str {
    let bytes = term.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'\'' || first == b'"' || first == b'`') && bytes[bytes.len() - 1] == first {
            return &term[1..term.len() - 1];
        }
    }
    term
}

/// Translate a pattern with SQL wildcards (% and _) into an anchored
/// regex.
fn wildcard_regex(pattern: &str) -> Result<regex::Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    regex::Regex::new(&out).context("bad search pattern")
}

/// Split `db.name` at the first dot outside quotes.
fn split_search(term: &str) -> (Option<&str>, &str) {
    let mut quote: Option<char> = None;
    for (idx, ch) in term.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '.' => return (Some(&term[..idx]), &term[idx + 1..]),
                _ => {}
            },
        }
    }
    (None, term)
}

fn search_items(dump: &ImageDump, term: &str, args: &Args) -> Result<()> {
    let (db_part, name_part) = split_search(term);
    let name_re = wildcard_regex(unquote(name_part))?;
    let db_re = match db_part {
        Some(part) => Some(wildcard_regex(unquote(part))?),
        None => None,
    };

    let cat = &dump.catalog;
    let mut hits = 0;
    for (item_ref, item) in cat.image_order() {
        let name = display_name(item.name());
        if !name_re.is_match(&name) {
            continue;
        }
        if let Some(db_re) = &db_re {
            let db_pos = match item_ref {
                ItemRef::Table { snap_num, pos } => cat.get_table(snap_num, pos).map(|t| t.db),
                ItemRef::DbObject { db, .. } | ItemRef::TableObject { db, .. } => Some(db),
                _ => None,
            };
            let db_name = match db_pos.and_then(|pos| cat.get_db(pos)) {
                Some(db) => display_name(&db.name).into_owned(),
                None => continue,
            };
            if !db_re.is_match(&db_name) {
                continue;
            }
        }
        hits += 1;
        println!(
            "{:<18} {:<12} {}",
            item.item_type().describe(),
            coordinate(item_ref),
            item_location(cat, item_ref, &item)
        );
        if let Some(meta) = item.meta() {
            if args.metadata_statements && !meta.create_stmt.is_empty() {
                println!("    {}", String::from_utf8_lossy(&meta.create_stmt));
            }
            if args.metadata_extra {
                println!(
                    "    {} extra bytes",
                    display_bytes(meta.extra.len() as u64, args.exact)
                );
            }
        }
    }
    if hits == 0 {
        bail!("no object matches `{}`", term);
    }
    Ok(())
}

fn run() -> Result<()> {
    let mut args = Args::parse();

    if args.all {
        args.catalog_summary = true;
        args.catalog_details = true;
        args.metadata_statements = true;
        args.metadata_extra = true;
        args.data_totals = true;
        args.summary = true;
    }
    let nothing_selected = !(args.catalog_summary
        || args.catalog_details
        || args.metadata_statements
        || args.metadata_extra
        || args.snapshots
        || args.data_chunks
        || args.data_totals
        || args.summary
        || args.image_order
        || args.search.is_some());
    if nothing_selected {
        args.catalog_summary = true;
    }

    let dump = read_image(&args.image, args.data_chunks, args.exact)?;

    let header = &dump.catalog.header;
    println!(
        "Image {}: server version {}, {} snapshots, {} tables",
        args.image.display(),
        header.server_version,
        dump.catalog.snap_count(),
        dump.catalog.table_count()
    );

    if let Some(term) = &args.search {
        return search_items(&dump, term, &args);
    }

    if args.catalog_summary {
        print_catalog_summary(&dump.catalog);
    }
    if args.catalog_details {
        print_catalog_details(&dump.catalog);
    }
    if args.metadata_statements || args.metadata_extra {
        print_metadata(
            &dump.catalog,
            args.metadata_statements,
            args.metadata_extra,
            args.exact,
        );
    }
    if args.snapshots {
        print_snapshots(&dump.catalog);
    }
    if args.data_chunks {
        println!("Data chunks:");
        for line in &dump.chunk_lines {
            println!("  {}", line);
        }
    }
    if args.data_totals {
        print_data_totals(&dump, args.exact);
    }
    if args.summary {
        print_summary(&dump, args.exact);
    }
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("ERROR: {:#}", err);
        std::process::exit(1);
    }
}
