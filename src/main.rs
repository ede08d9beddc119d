//! CLI front-end (spec.md §6): a single flat flag struct mirroring dar's
//! own mode-selecting flags (`-c`/`-x`/`-t`/`-d`/`-l`/`-C`/`-+`) rather
//! than `clap` subcommands, built with the same derive API
//! `examples/ShinyJonny-fsfill` drives its own `Args` struct with.
//!
//! Command-line parsing, configuration-file inclusion and localisation
//! are all explicitly out of the core's scope (spec.md §1); this module
//! is the thin, replaceable shell around it.

use std::path::PathBuf;

use clap::Parser;
use rand::Rng;

mod archive;
mod array;
mod backup;
mod catalog;
mod channel;
mod cipher;
mod compress;
mod crc;
mod datetime;
mod delta;
mod error;
mod escape;
mod fsattr;
mod header;
mod logger;
mod mask;
mod merge;
mod number;
mod path;
mod policy;
mod restore;
mod slice;
mod util;

use archive::CompressionAlgo;
use catalog::Catalog;
use channel::ByteChannel;
use error::{exit_code, DarError, ErrorKind};
use logger::Logger;
use mask::Mask;
use policy::{Action, ActionPair, ComparisonFields, Criterion, DataAction, MetaAction};
use slice::SliceConfig;

/// disk ARchive clone: a backup/restore engine that packages a filesystem
/// subtree, its extended attributes and its filesystem-specific
/// attributes into a single, optionally sliced/compressed/encrypted
/// archive (spec.md §1, §6).
#[derive(Debug, Parser)]
#[clap(name = "darc", version)]
struct Args {
    /// Create a new archive with this basename.
    #[clap(short = 'c', value_name = "ARCHIVE")]
    create: Option<String>,

    /// Extract (restore) the archive with this basename.
    #[clap(short = 'x', value_name = "ARCHIVE")]
    extract: Option<String>,

    /// Test the archive with this basename (verify content CRCs).
    #[clap(short = 't', value_name = "ARCHIVE")]
    test: Option<String>,

    /// Compare the archive with this basename against the filesystem.
    #[clap(short = 'd', value_name = "ARCHIVE")]
    diff: Option<String>,

    /// List the contents of the archive with this basename.
    #[clap(short = 'l', value_name = "ARCHIVE")]
    list: Option<String>,

    /// Isolate the catalogue of the archive named by `-A` into a new,
    /// small, data-less archive with this basename.
    #[clap(short = 'C', value_name = "ARCHIVE")]
    isolate: Option<String>,

    /// Merge the archives named by `-A` and `--aux` into a new archive
    /// with this basename.
    #[clap(short = '+', long = "merge", value_name = "ARCHIVE")]
    merge: Option<String>,

    /// Root directory a backup is taken from, or a restore/diff is
    /// applied under.
    #[clap(short = 'R', long, value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// Size of the first slice (e.g. "10M"); omit for a single,
    /// unsplittable archive file.
    #[clap(short = 's', value_name = "SIZE")]
    first_slice_size: Option<String>,

    /// Size of every slice after the first; defaults to the first
    /// slice's size.
    #[clap(short = 'S', value_name = "SIZE")]
    other_slice_size: Option<String>,

    /// Compression: `n` (none, default), `z` (gzip-class) or `y`
    /// (bzip2-class).
    #[clap(short = 'z', value_name = "ALGO", default_value = "n")]
    compression: String,

    /// Exclude names matching this glob (repeatable).
    #[clap(short = 'X', value_name = "GLOB")]
    exclude_name: Vec<String>,

    /// Only include names matching this glob (repeatable).
    #[clap(short = 'I', value_name = "GLOB")]
    include_name: Vec<String>,

    /// Exclude paths matching this glob (repeatable).
    #[clap(short = 'P', value_name = "GLOB")]
    exclude_path: Vec<String>,

    /// Only include paths matching this glob (repeatable).
    #[clap(short = 'g', value_name = "GLOB")]
    include_path: Vec<String>,

    /// Reference archive basename: the `-A` backup/restore/merge/diff
    /// reference (spec.md §4.9/§4.8/§4.11).
    #[clap(short = 'A', value_name = "ARCHIVE")]
    reference: Option<String>,

    /// The second source archive's basename for a merge (spec.md §4.11);
    /// left unspecified, see DESIGN.md's note on `--aux`/`--snapshot`.
    #[clap(long, value_name = "ARCHIVE")]
    aux: Option<String>,

    /// Decremental merge (spec.md §4.11): emit `--aux`'s entries as
    /// deleted-markers plus `-A`'s entries that are new or newer.
    #[clap(long)]
    decremental: bool,

    /// Password to encrypt/decrypt the archive being created/read.
    #[clap(short = 'K', value_name = "PASS")]
    password: Option<String>,

    /// Password for the `-A` reference archive, if it is itself
    /// encrypted with a different one.
    #[clap(short = 'J', value_name = "PASS")]
    ref_password: Option<String>,

    /// Shell command run between slices; `%p`/`%n` are substituted with
    /// the finished slice's path/number.
    #[clap(short = 'E', value_name = "CMD")]
    hook: Option<String>,

    /// Never overwrite anything already present at the restore/merge
    /// target.
    #[clap(short = 'n')]
    no_overwrite: bool,

    /// Ask for confirmation before overwriting anything already present.
    #[clap(short = 'w')]
    warn_overwrite: bool,

    /// Record directories excluded by a mask as empty placeholders,
    /// rather than omitting them entirely.
    #[clap(short = 'D')]
    record_excluded_dirs: bool,

    /// Do not cross filesystem boundaries while backing up.
    #[clap(short = 'M')]
    same_filesystem: bool,

    /// Compute and store a rolling delta signature for every saved file,
    /// and diff against a `-A` reference's own stored signature instead
    /// of resaving a changed file whole, when one is available (spec.md
    /// §4.9's delta path).
    #[clap(long)]
    delta_sig: bool,

    /// Honour the filesystem's "nodump" flag.
    #[clap(long)]
    nodump: bool,

    /// Never compress a file smaller than this size (e.g. "2k"); files
    /// below this threshold are stored literally even when `-z`/`-y` is set.
    #[clap(long, value_name = "SIZE")]
    min_compr_size: Option<String>,

    /// Treat a directory tagged per the cache-directory-tagging standard
    /// (a `CACHEDIR.TAG` file) as excluded from the backup.
    #[clap(long)]
    cache_directory_tagging: bool,

    /// Restore/compare owner and group (requires appropriate privilege).
    #[clap(long)]
    restore_ownership: bool,

    /// Extract every file directly under the restore root, discarding the
    /// archive's directory structure.
    #[clap(long)]
    flat: bool,

    /// Which fields to compare against what's already in place before
    /// deciding whether to overwrite it: `all` (default), `ignore-owner`,
    /// `mtime`, or `nothing` (always overwrite, skipping the comparison).
    #[clap(long, value_name = "FIELDS", default_value = "all")]
    what_to_check: String,

    /// Log a line before an entry already in place is removed.
    #[clap(long)]
    warn_remove: bool,

    /// Dry run: report what a restore would do without writing, creating
    /// or removing anything.
    #[clap(long)]
    empty: bool,

    /// Only restore entries that already exist at the restore target;
    /// skip anything the archive names that isn't already in place.
    #[clap(long)]
    only_overwrite: bool,

    /// Increase verbosity (repeatable).
    #[clap(short = 'v', long, parse(from_occurrences))]
    verbose: u32,

    /// Append a one-line record of every processed entry to this file.
    #[clap(short = 'L', long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Parses a size string such as `"10M"`/`"650k"`/`"4G"`/`"2048"` into a
/// byte count (spec.md §6's `-s`/`-S`); the suffix is a power-of-1024
/// multiplier, case-insensitive, matching the units a human would type at
/// the same CLI dar's own `-s`/`-S` accept.
fn parse_size(s: &str) -> Result<u64, DarError>
{
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&s[..s.len() - 1], 1024u64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&s[..s.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'t') => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits.trim().parse().map_err(|_| DarError::new(ErrorKind::Deci, format!("not a size: {s:?}")))?;
    Ok(n * mult)
}

fn build_mask(excl_name: &[String], incl_name: &[String], excl_path: &[String], incl_path: &[String]) -> Result<Mask, DarError>
{
    let glob_or = |patterns: &[String]| -> Result<Option<Mask>, DarError> {
        let mut acc: Option<Mask> = None;
        for p in patterns {
            let m = Mask::glob(p).map_err(|e| DarError::range(e.to_string()))?;
            acc = Some(match acc {
                Some(prev) => prev.or(m),
                None => m,
            });
        }
        Ok(acc)
    };

    let mut mask = Mask::None;
    if let Some(m) = glob_or(excl_name)? {
        mask = mask.or(m);
    }
    if let Some(m) = glob_or(incl_name)? {
        mask = mask.or(m.not());
    }
    if let Some(m) = glob_or(excl_path)? {
        mask = mask.or(m);
    }
    if let Some(m) = glob_or(incl_path)? {
        mask = mask.or(m.not());
    }
    Ok(mask)
}

fn overwrite_policy(args: &Args) -> Action
{
    if args.no_overwrite {
        return policy::default_preserve();
    }
    if args.warn_overwrite {
        return Action::Const(ActionPair::new(DataAction::Ask, MetaAction::Ask));
    }
    Action::Testing(
        Criterion::IncomingIsDirectory,
        Box::new(policy::default_overwrite()),
        Box::new(policy::overwrite_if_newer()),
    )
}

/// Resolves an `Ask` leaf (spec.md §4.8) to a concrete decision via a
/// stdin prompt; used by restore and merge whenever `-w` is set.
fn stdin_ask(in_place: &catalog::Entry, incoming: &catalog::Entry) -> ActionPair
{
    use std::io::Write as _;
    eprint!(
        "overwrite {:?} with {:?}? [y/N] ",
        in_place.name().unwrap_or(""),
        incoming.name().unwrap_or("")
    );
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    if line.trim().eq_ignore_ascii_case("y") {
        ActionPair::new(DataAction::Overwrite, MetaAction::Overwrite)
    } else {
        ActionPair::new(DataAction::Preserve, MetaAction::Preserve)
    }
}

/// Picks the `ask` callback for an overwrite-policy leaf, as a bare `fn`
/// pointer rather than a boxed closure: neither branch captures anything,
/// so there is no environment to own.
fn pick_ask(args: &Args) -> fn(&catalog::Entry, &catalog::Entry) -> ActionPair
{
    fn never_asked(_: &catalog::Entry, _: &catalog::Entry) -> ActionPair
    {
        unreachable!("policy never asks without -w")
    }
    if args.warn_overwrite {
        stdin_ask
    } else {
        never_asked
    }
}

fn comparison_fields(tag: &str) -> Result<ComparisonFields, DarError>
{
    match tag {
        "all" => Ok(ComparisonFields::All),
        "ignore-owner" => Ok(ComparisonFields::IgnoreOwner),
        "mtime" => Ok(ComparisonFields::Mtime),
        "nothing" => Ok(ComparisonFields::Nothing),
        other => Err(DarError::feature(format!("unknown --what-to-check value '{other}'"))),
    }
}

fn compression_algo(tag: &str) -> Result<CompressionAlgo, DarError>
{
    match tag.chars().next() {
        Some('n') | None => Ok(CompressionAlgo::None),
        Some('z') => Ok(CompressionAlgo::Gzip),
        Some('y') => Ok(CompressionAlgo::Bzip2),
        Some(other) => Err(DarError::feature(format!("unsupported compression algorithm '{other}'"))),
    }
}

fn slice_config(basename: &str, args: &Args, label: [u8; 16]) -> Result<SliceConfig, DarError>
{
    let first = args.first_slice_size.as_deref().map(parse_size).transpose()?;
    let other = args.other_slice_size.as_deref().map(parse_size).transpose()?;
    let (first_slice_size, other_slice_size) = match first {
        Some(f) => (f, other.unwrap_or(f)),
        None => (u64::MAX, 0),
    };
    Ok(SliceConfig {
        basename: PathBuf::from(basename),
        extension: "dar".to_string(),
        first_slice_size,
        other_slice_size,
        internal_label: label,
        between_slice_hook: args.hook.clone(),
        pause_between_slices: false,
    })
}

/// Reads just enough of slice 1's header to learn the archive's internal
/// label, so an existing archive can be opened without the caller having
/// to supply the label it was created with (spec.md §4.2: "the first
/// opening probes for slice 1").
fn peek_label(basename: &str) -> Result<[u8; 16], DarError>
{
    let path = {
        let mut p = PathBuf::from(basename);
        let name = format!("{}.1.dar", p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
        p.set_file_name(name);
        p
    };
    let mut f = std::fs::File::open(&path).map_err(|e| DarError::new(ErrorKind::Hardware, format!("{}: {}", path.display(), e)))?;
    let header = slice::SliceHeader::read_from(&mut f).map_err(|e| DarError::new(ErrorKind::Range, format!("{}: {}", path.display(), e)))?;
    if header.magic != slice::SLICE_MAGIC {
        return Err(DarError::range(format!("{}: not a darc archive slice", path.display())));
    }
    Ok(header.internal_label.0)
}

fn open_archive(basename: &str, password: Option<&str>, args: &Args) -> Result<(archive::Archive<archive::Lower>, Catalog), DarError>
{
    let label = peek_label(basename)?;
    let opts = archive::OpenOptions {
        slice_config: slice_config(basename, args, label)?,
        password: password.map(str::to_string),
    };
    archive::open_on_disk(opts)
}

fn run() -> Result<i32, DarError>
{
    let args = Args::parse();

    let selected = [
        args.create.is_some(),
        args.extract.is_some(),
        args.test.is_some(),
        args.diff.is_some(),
        args.list.is_some(),
        args.isolate.is_some(),
        args.merge.is_some(),
    ]
    .iter()
    .filter(|b| **b)
    .count();
    if selected != 1 {
        eprintln!("darc: exactly one of -c/-x/-t/-d/-l/-C/-+ is required");
        return Ok(exit_code::SYNTAX);
    }

    let mut log_file = None;
    if let Some(path) = &args.log_file {
        log_file = std::fs::OpenOptions::new().create(true).append(true).open(path).ok();
    }
    let mut logger = Logger::new(args.verbose, log_file);

    let mask = build_mask(&args.exclude_name, &args.include_name, &args.exclude_path, &args.include_path)?;

    if let Some(basename) = &args.create {
        let reference = args
            .reference
            .as_deref()
            .map(|r| open_archive(r, args.ref_password.as_deref(), &args))
            .transpose()?;
        let (mut reference_archive, mut reference_catalog) = match reference {
            Some((a, c)) => (Some(a), Some(c)),
            None => (None, None),
        };

        let label: [u8; 16] = rand::thread_rng().gen();
        let compression = compression_algo(&args.compression)?;
        let create_opts = archive::CreateOptions {
            slice_config: slice_config(basename, &args, label)?,
            compression,
            password: args.password.clone(),
            provenance: std::env::args().collect::<Vec<_>>().join(" "),
            flags: header::HeaderFlags {
                ea_root_saved: true,
                ea_user_saved: true,
                scrambled: args.password.is_some(),
                sequential_marks_present: true,
                signed: false,
                delta_present: args.delta_sig,
            },
            label,
        };
        let mut dest = archive::create_on_disk(create_opts)?;

        let backup_opts = backup::BackupOptions {
            root: args.root.clone(),
            mask,
            record_excluded_dirs: args.record_excluded_dirs,
            same_filesystem: args.same_filesystem,
            honour_nodump: args.nodump,
            save_ea: true,
            save_fsa: true,
            delta_sig: args.delta_sig,
            compr_mask: Mask::All,
            min_compr_size: args.min_compr_size.map(parse_size).transpose()?.unwrap_or(0),
            cache_directory_tagging: args.cache_directory_tagging,
        };
        let catalog = backup::run_backup(&mut dest, &backup_opts, reference_catalog.as_mut(), reference_archive.as_mut(), &mut logger)?;
        dest.finish_create(&catalog)?;
    } else if let Some(basename) = &args.extract {
        let (mut src, mut catalog) = open_archive(basename, args.password.as_deref(), &args)?;
        let restore_opts = restore::RestoreOptions {
            target: args.root.clone(),
            mask,
            action: overwrite_policy(&args),
            restore_ea: true,
            restore_fsa: true,
            set_ownership: args.restore_ownership,
            flat: args.flat,
            what_to_check: comparison_fields(&args.what_to_check)?,
            warn_before_remove: args.warn_remove,
            empty: args.empty,
            only_overwrite: args.only_overwrite,
        };
        let ask_fn = pick_ask(&args);
        restore::run_restore(&mut src, &mut catalog, &restore_opts, &mut logger, &mut |a, b| ask_fn(a, b))?;
    } else if let Some(basename) = &args.test {
        let (mut src, mut catalog) = open_archive(basename, args.password.as_deref(), &args)?;
        catalog.reset_read();
        while let Some(entry) = catalog.read() {
            let name = entry.name().unwrap_or("").to_string();
            if let catalog::Entry::File(f) = &entry {
                if let Some(offset) = f.offset {
                    let outcome = (|| -> Result<(), DarError> {
                        src.body().skip(offset)?;
                        let mut buf = vec![0u8; f.stored_size as usize];
                        channel::read_exact(src.body(), &mut buf)?;
                        if let Some(crc) = &f.content_crc {
                            let mut acc = crc::CrcAccumulator::new(crc.width());
                            acc.update(&buf);
                            if &acc.finish() != crc {
                                return Err(DarError::range("content CRC mismatch"));
                            }
                        }
                        Ok(())
                    })();
                    match outcome {
                        Ok(()) => logger.note(logger::EntryOutcome::Saved, &name),
                        Err(e) => logger.note(logger::EntryOutcome::Errored, &format!("{}: {}", name, e)),
                    }
                }
            }
        }
    } else if let Some(basename) = &args.diff {
        let (_src, mut catalog) = open_archive(basename, args.password.as_deref(), &args)?;
        let diff_opts = backup::DiffOptions { root: args.root.clone(), mask };
        backup::run_diff(&diff_opts, &mut catalog, &mut logger)?;
    } else if let Some(basename) = &args.list {
        let (_src, mut catalog) = open_archive(basename, args.password.as_deref(), &args)?;
        catalog.reset_read();
        while let Some(entry) = catalog.read() {
            print_listing_row(&entry);
        }
    } else if let Some(basename) = &args.isolate {
        let reference = args.reference.as_deref().ok_or_else(|| DarError::range("-C requires -A"))?;
        let (_src, catalog) = open_archive(reference, args.ref_password.as_deref(), &args)?;

        let label: [u8; 16] = rand::thread_rng().gen();
        let create_opts = archive::CreateOptions {
            slice_config: slice_config(basename, &args, label)?,
            compression: compression_algo(&args.compression)?,
            password: args.password.clone(),
            provenance: std::env::args().collect::<Vec<_>>().join(" "),
            flags: header::HeaderFlags { sequential_marks_present: true, ..Default::default() },
            label,
        };
        let dest = archive::create_on_disk(create_opts)?;
        dest.finish_create(&catalog)?;
    } else if let Some(basename) = &args.merge {
        let ref_a = args.reference.as_deref().ok_or_else(|| DarError::range("-+ requires -A"))?;
        let ref_b = args.aux.as_deref().ok_or_else(|| DarError::range("-+ requires --aux"))?;
        let (mut src_a, cat_a) = open_archive(ref_a, args.password.as_deref(), &args)?;
        let (mut src_b, cat_b) = open_archive(ref_b, args.ref_password.as_deref(), &args)?;

        let label: [u8; 16] = rand::thread_rng().gen();
        let create_opts = archive::CreateOptions {
            slice_config: slice_config(basename, &args, label)?,
            compression: compression_algo(&args.compression)?,
            password: args.password.clone(),
            provenance: std::env::args().collect::<Vec<_>>().join(" "),
            flags: header::HeaderFlags { sequential_marks_present: true, ..Default::default() },
            label,
        };
        let mut dest = archive::create_on_disk(create_opts)?;

        let merge_opts = merge::MergeOptions { action: overwrite_policy(&args), decremental: args.decremental };
        let ask_fn = pick_ask(&args);
        let merged = merge::run_merge(&mut src_a, &cat_a, &mut src_b, &cat_b, &mut dest, &merge_opts, &mut logger, &mut |a, b| ask_fn(a, b))?;
        dest.finish_create(&merged)?;
    }

    logger.summary();
    Ok(error::exit_code_for(ErrorKind::Hardware, logger.counters()))
}

fn print_listing_row(entry: &catalog::Entry)
{
    let kind = match entry {
        catalog::Entry::Directory(_) => 'd',
        catalog::Entry::File(_) => '-',
        catalog::Entry::Symlink(_) => 'l',
        catalog::Entry::CharDevice(_) => 'c',
        catalog::Entry::BlockDevice(_) => 'b',
        catalog::Entry::Pipe(_) => 'p',
        catalog::Entry::Socket(_) => 's',
        catalog::Entry::Door(_) => 'D',
        catalog::Entry::Deleted(_) => 'X',
        catalog::Entry::Mirage(_) => 'h',
        catalog::Entry::Ignored(_) | catalog::Entry::IgnoredDirectory(_) | catalog::Entry::EndOfDirectory => return,
    };
    let name = entry.name().unwrap_or("");
    let size = match entry {
        catalog::Entry::File(f) => f.uncompressed_size.to_string(),
        _ => "-".to_string(),
    };
    println!("{kind} {size:>12} {name}");
}

fn main()
{
    let result = run();
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("darc: {e}");
            std::process::exit(error::exit_code_for(e.kind, &error::RunCounters::new()));
        }
    }
}

/// End-to-end exercises of the pieces `run()` wires together (spec.md §8's
/// round-trip scenarios), since `run()` itself only reads `std::env::args`
/// and can't be driven directly from a unit test.
#[cfg(test)]
mod round_trip_tests {
    use super::*;
    use std::fs;

    fn unsliced(basename: &std::path::Path, label: [u8; 16]) -> SliceConfig
    {
        SliceConfig {
            basename: basename.to_path_buf(),
            extension: "dar".to_string(),
            first_slice_size: 0,
            other_slice_size: 0,
            internal_label: label,
            between_slice_hook: None,
            pause_between_slices: false,
        }
    }

    fn no_op_flags() -> header::HeaderFlags
    {
        header::HeaderFlags {
            ea_root_saved: true,
            ea_user_saved: true,
            scrambled: false,
            sequential_marks_present: true,
            signed: false,
            delta_present: false,
        }
    }

    fn backup_tree(root: &std::path::Path, basename: &std::path::Path, label: [u8; 16], delta_sig: bool)
    {
        let create_opts = archive::CreateOptions {
            slice_config: unsliced(basename, label),
            compression: CompressionAlgo::None,
            password: None,
            provenance: "test".to_string(),
            flags: no_op_flags(),
            label,
        };
        let mut dest = archive::create_on_disk(create_opts).unwrap();
        let backup_opts = backup::BackupOptions {
            root: root.to_path_buf(),
            mask: Mask::None,
            record_excluded_dirs: false,
            same_filesystem: false,
            honour_nodump: false,
            save_ea: true,
            save_fsa: true,
            delta_sig,
            compr_mask: Mask::All,
            min_compr_size: 0,
            cache_directory_tagging: false,
        };
        let mut logger = Logger::new(0, None);
        let catalog = backup::run_backup(&mut dest, &backup_opts, None, None, &mut logger).unwrap();
        dest.finish_create(&catalog).unwrap();
    }

    fn restore_tree(basename: &std::path::Path, label: [u8; 16], target: &std::path::Path)
    {
        let (mut src, mut catalog) = archive::open_on_disk(archive::OpenOptions {
            slice_config: unsliced(basename, label),
            password: None,
        })
        .unwrap();
        let restore_opts = restore::RestoreOptions {
            target: target.to_path_buf(),
            mask: Mask::None,
            action: policy::default_overwrite(),
            restore_ea: true,
            restore_fsa: true,
            set_ownership: false,
            flat: false,
            what_to_check: ComparisonFields::All,
            warn_before_remove: false,
            empty: false,
            only_overwrite: false,
        };
        let mut logger = Logger::new(0, None);
        restore::run_restore(&mut src, &mut catalog, &restore_opts, &mut logger, &mut |_, _| {
            ActionPair::new(DataAction::Overwrite, MetaAction::Overwrite)
        })
        .unwrap();
    }

    #[test]
    fn empty_tree_archives_and_lists_as_just_the_root()
    {
        let src = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let basename = archive_dir.path().join("empty");
        let label = [1u8; 16];
        backup_tree(src.path(), &basename, label, false);

        let (_src, mut catalog) = archive::open_on_disk(archive::OpenOptions {
            slice_config: unsliced(&basename, label),
            password: None,
        })
        .unwrap();
        catalog.reset_read();
        assert!(catalog.read().is_none(), "empty source tree should yield no entries below the root");
    }

    #[test]
    fn backup_then_restore_round_trips_files_dirs_and_symlinks()
    {
        let src = tempfile::tempdir().unwrap();
        let root = src.path();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/hello.txt"), b"hello world").unwrap();
        std::os::unix::fs::symlink("hello.txt", root.join("sub/link")).unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let basename = archive_dir.path().join("full");
        let label = [2u8; 16];
        backup_tree(root, &basename, label, false);

        let restore_dir = tempfile::tempdir().unwrap();
        restore_tree(&basename, label, restore_dir.path());

        let restored = fs::read(restore_dir.path().join("sub/hello.txt")).unwrap();
        assert_eq!(restored, b"hello world");
        let link = fs::read_link(restore_dir.path().join("sub/link")).unwrap();
        assert_eq!(link, std::path::PathBuf::from("hello.txt"));
    }

    #[test]
    fn hard_linked_files_share_one_inode_after_restore()
    {
        let src = tempfile::tempdir().unwrap();
        let root = src.path();
        fs::write(root.join("a"), b"shared content").unwrap();
        fs::hard_link(root.join("a"), root.join("b")).unwrap();
        fs::hard_link(root.join("a"), root.join("c")).unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let basename = archive_dir.path().join("links");
        let label = [3u8; 16];
        backup_tree(root, &basename, label, false);

        let restore_dir = tempfile::tempdir().unwrap();
        restore_tree(&basename, label, restore_dir.path());

        use std::os::unix::fs::MetadataExt;
        let ino_a = fs::metadata(restore_dir.path().join("a")).unwrap().ino();
        let ino_b = fs::metadata(restore_dir.path().join("b")).unwrap().ino();
        let ino_c = fs::metadata(restore_dir.path().join("c")).unwrap().ino();
        assert_eq!(ino_a, ino_b);
        assert_eq!(ino_b, ino_c);
    }

    #[test]
    fn differential_backup_restores_additions_changes_and_deletions()
    {
        let src = tempfile::tempdir().unwrap();
        let root = src.path();
        fs::write(root.join("keep.txt"), b"unchanged").unwrap();
        fs::write(root.join("change.txt"), b"before").unwrap();
        fs::write(root.join("remove.txt"), b"gone soon").unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let full_basename = archive_dir.path().join("full");
        let label_full = [4u8; 16];
        backup_tree(root, &full_basename, label_full, false);

        // Mutate the tree: change one file's content, delete another, add a third.
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(root.join("change.txt"), b"after, and longer").unwrap();
        fs::remove_file(root.join("remove.txt")).unwrap();
        fs::write(root.join("added.txt"), b"new").unwrap();

        let (_ref_archive_dropped, mut reference_catalog) = archive::open_on_disk(archive::OpenOptions {
            slice_config: unsliced(&full_basename, label_full),
            password: None,
        })
        .unwrap();

        let diff_basename = archive_dir.path().join("diff");
        let label_diff = [5u8; 16];
        let create_opts = archive::CreateOptions {
            slice_config: unsliced(&diff_basename, label_diff),
            compression: CompressionAlgo::None,
            password: None,
            provenance: "test".to_string(),
            flags: no_op_flags(),
            label: label_diff,
        };
        let mut dest = archive::create_on_disk(create_opts).unwrap();
        let backup_opts = backup::BackupOptions {
            root: root.to_path_buf(),
            mask: Mask::None,
            record_excluded_dirs: false,
            same_filesystem: false,
            honour_nodump: false,
            save_ea: true,
            save_fsa: true,
            delta_sig: false,
            compr_mask: Mask::All,
            min_compr_size: 0,
            cache_directory_tagging: false,
        };
        let mut logger = Logger::new(0, None);
        let diff_catalog = backup::run_backup(&mut dest, &backup_opts, Some(&mut reference_catalog), None, &mut logger).unwrap();
        dest.finish_create(&diff_catalog).unwrap();

        // Restore the full archive, then layer the differential on top.
        let restore_dir = tempfile::tempdir().unwrap();
        restore_tree(&full_basename, label_full, restore_dir.path());
        restore_tree(&diff_basename, label_diff, restore_dir.path());

        assert_eq!(fs::read(restore_dir.path().join("keep.txt")).unwrap(), b"unchanged");
        assert_eq!(fs::read(restore_dir.path().join("change.txt")).unwrap(), b"after, and longer");
        assert_eq!(fs::read(restore_dir.path().join("added.txt")).unwrap(), b"new");
        assert!(!restore_dir.path().join("remove.txt").exists(), "differential restore should have removed it");
    }

    #[test]
    fn delta_backup_patches_a_changed_file_against_its_stored_signature()
    {
        let src = tempfile::tempdir().unwrap();
        let root = src.path();
        let big = vec![b'x'; crate::delta::BLOCK_SIZE * 8];
        fs::write(root.join("big.bin"), &big).unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let full_basename = archive_dir.path().join("full");
        let label_full = [6u8; 16];
        backup_tree(root, &full_basename, label_full, true);

        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut changed = big.clone();
        changed[crate::delta::BLOCK_SIZE * 3..crate::delta::BLOCK_SIZE * 3 + 16].copy_from_slice(&[b'y'; 16]);
        fs::write(root.join("big.bin"), &changed).unwrap();

        let (mut ref_archive, mut reference_catalog) = archive::open_on_disk(archive::OpenOptions {
            slice_config: unsliced(&full_basename, label_full),
            password: None,
        })
        .unwrap();

        let delta_basename = archive_dir.path().join("delta");
        let label_delta = [7u8; 16];
        let create_opts = archive::CreateOptions {
            slice_config: unsliced(&delta_basename, label_delta),
            compression: CompressionAlgo::None,
            password: None,
            provenance: "test".to_string(),
            flags: no_op_flags(),
            label: label_delta,
        };
        let mut dest = archive::create_on_disk(create_opts).unwrap();
        let backup_opts = backup::BackupOptions {
            root: root.to_path_buf(),
            mask: Mask::None,
            record_excluded_dirs: false,
            same_filesystem: false,
            honour_nodump: false,
            save_ea: true,
            save_fsa: true,
            delta_sig: true,
            compr_mask: Mask::All,
            min_compr_size: 0,
            cache_directory_tagging: false,
        };
        let mut logger = Logger::new(0, None);
        let delta_catalog = backup::run_backup(&mut dest, &backup_opts, Some(&mut reference_catalog), Some(&mut ref_archive), &mut logger).unwrap();

        let entry = delta_catalog.root().find("big.bin").expect("big.bin should have been saved");
        match entry {
            catalog::Entry::File(f) => {
                assert_eq!(f.inode.saved, catalog::entry::SavedStatus::Delta);
                assert!(f.stored_size < big.len() as u64, "a small single-region edit should patch far smaller than the full file");
            }
            other => panic!("expected a plain file entry, got {other:?}"),
        }
        dest.finish_create(&delta_catalog).unwrap();

        let restore_dir = tempfile::tempdir().unwrap();
        restore_tree(&full_basename, label_full, restore_dir.path());
        restore_tree(&delta_basename, label_delta, restore_dir.path());
        assert_eq!(fs::read(restore_dir.path().join("big.bin")).unwrap(), changed);
    }
}

