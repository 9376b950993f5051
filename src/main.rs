use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use chrono::NaiveDateTime;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};

use chainsaw::{
    Filter, Format, Hunter, RuleKind, Searcher, ShimcacheAnalyser, SrumAnalyser, Writer, cli,
    cs_egreenln, cs_eprintln, cs_eredln, cs_eyellowln, cs_println, file, get_files,
    known_extensions, lint, load, set_writer,
    tau::optimiser,
    value::{Value, parse_datetime},
};

#[derive(Parser)]
#[command(
    name = "chainsaw",
    about = "Rapidly Search and Hunt Through Windows Forensic Artefacts",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Only show errors
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,
    /// Print verbose output
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Suppress the banner
    #[arg(long = "no-banner", global = true)]
    no_banner: bool,
    /// Limit the number of threads, defaults to the number of CPUs
    #[arg(long = "num-threads", global = true)]
    num_threads: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Hunt through artefacts using detection rules for threat detection
    Hunt {
        /// The paths containing files to load and hunt through
        path: Vec<PathBuf>,

        /// A path containing chainsaw rules to hunt with
        #[arg(short = 'r', long = "rule")]
        rule: Vec<PathBuf>,
        /// A path containing Sigma rules to hunt with
        #[arg(short = 's', long = "sigma")]
        sigma: Vec<PathBuf>,
        /// A path containing the mapping files needed by Sigma rules
        #[arg(short = 'm', long = "mapping")]
        mapping: Vec<PathBuf>,

        /// The timestamp to hunt from, in UTC (YYYY-MM-DDTHH:MM:SS)
        #[arg(long = "from")]
        from: Option<String>,
        /// The timestamp to hunt up to, in UTC (YYYY-MM-DDTHH:MM:SS)
        #[arg(long = "to")]
        to: Option<String>,
        /// Input timestamps are in the local timezone
        #[arg(long = "local")]
        local: bool,
        /// Input timestamps are in this timezone
        #[arg(long = "timezone")]
        timezone: Option<String>,

        /// Print the output in json format
        #[arg(long = "json", group = "format")]
        json: bool,
        /// Print the output in jsonl format
        #[arg(long = "jsonl", group = "format")]
        jsonl: bool,
        /// Print the full values for the tabular output
        #[arg(long = "full")]
        full: bool,
        /// Display additional metadata in the tabular output
        #[arg(long = "metadata")]
        metadata: bool,
        /// Set the column width for the tabular output
        #[arg(long = "column-width")]
        column_width: Option<u32>,

        /// Continue hunting when an error is encountered
        #[arg(long = "skip-errors")]
        skip_errors: bool,
        /// Allow chainsaw to try and load files it does not know about
        #[arg(long = "load-unknown")]
        load_unknown: bool,
        /// The file to output to
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Search through forensic artefacts for keywords or patterns
    Search {
        /// The paths containing files to load and search through
        path: Vec<PathBuf>,

        /// A pattern to search for
        #[arg(short = 'e', long = "regex")]
        pattern: Vec<String>,
        /// A tau key value pair to filter with (e.g. 'Event.System.EventID: 4624')
        #[arg(short = 't', long = "tau")]
        tau: Vec<String>,
        /// Make searches case insensitive
        #[arg(short = 'i', long = "ignore-case")]
        ignore_case: bool,
        /// Match any of the provided patterns rather than all of them
        #[arg(long = "match-any")]
        match_any: bool,

        /// The field containing the timestamp, for time filtering
        #[arg(long = "timestamp")]
        timestamp: Option<String>,
        /// The timestamp to search from, in UTC (YYYY-MM-DDTHH:MM:SS)
        #[arg(long = "from")]
        from: Option<String>,
        /// The timestamp to search up to, in UTC (YYYY-MM-DDTHH:MM:SS)
        #[arg(long = "to")]
        to: Option<String>,
        /// Input timestamps are in the local timezone
        #[arg(long = "local")]
        local: bool,
        /// Input timestamps are in this timezone
        #[arg(long = "timezone")]
        timezone: Option<String>,

        /// Print the output in json format
        #[arg(long = "json", group = "format")]
        json: bool,
        /// Print the output in jsonl format
        #[arg(long = "jsonl", group = "format")]
        jsonl: bool,

        /// Continue searching when an error is encountered
        #[arg(long = "skip-errors")]
        skip_errors: bool,
        /// Allow chainsaw to try and load files it does not know about
        #[arg(long = "load-unknown")]
        load_unknown: bool,
        /// The file to output to
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Dump forensic artefacts into a uniform document stream
    Dump {
        /// The paths containing files to load and dump
        path: Vec<PathBuf>,

        /// Only dump files with the given extensions
        #[arg(long = "extension")]
        extension: Vec<String>,

        /// Print the output in json format
        #[arg(long = "json", group = "format")]
        json: bool,
        /// Print the output in jsonl format
        #[arg(long = "jsonl", group = "format")]
        jsonl: bool,

        /// Continue dumping when an error is encountered
        #[arg(long = "skip-errors")]
        skip_errors: bool,
        /// Allow chainsaw to try and load files it does not know about
        #[arg(long = "load-unknown")]
        load_unknown: bool,
        /// The file to output to
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Lint provided rules to ensure that they load correctly
    Lint {
        /// The path containing rules to lint
        path: PathBuf,
        /// The kind of rule to lint: chainsaw, or sigma
        #[arg(long = "kind")]
        kind: String,
        /// Output the optimised tau representation of the detection logic
        #[arg(short = 't', long = "tau")]
        tau: bool,
    },

    /// Perform various analyses on artefacts
    Analyse {
        #[command(subcommand)]
        command: AnalyseCommand,
    },
}

#[derive(Subcommand)]
enum AnalyseCommand {
    /// Create an execution timeline from the shimcache, with optional
    /// amcache enrichment
    Shimcache {
        /// The path to the shimcache hive (SYSTEM)
        shimcache: PathBuf,
        /// The path to the amcache hive (Amcache.hve)
        #[arg(short = 'a', long = "amcache")]
        amcache: Option<PathBuf>,
        /// A regex pattern that anchors shimcache entry timestamps
        #[arg(short = 'e', long = "regex")]
        regex: Vec<String>,
        /// A file containing regex patterns, one per line
        #[arg(short = 'r', long = "regex-file")]
        regex_file: Option<PathBuf>,
        /// Enable near timestamp pair detection between amcache and shimcache
        #[arg(short = 'p', long = "tspair")]
        tspair: bool,
        /// The file to output to
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Analyse the SRUM database
    Srum {
        /// The path to the SRUM database (SRUDB.dat)
        srum: PathBuf,
        /// The path to the SOFTWARE hive
        #[arg(short = 's', long = "software")]
        software: PathBuf,
        /// Only output details about the SRUM database tables
        #[arg(long = "stats-only")]
        stats_only: bool,
        /// The file to output to
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
}

fn print_title() {
    cs_eprintln!(
        "
 ██████╗██╗  ██╗ █████╗ ██╗███╗   ██╗███████╗ █████╗ ██╗    ██╗
██╔════╝██║  ██║██╔══██╗██║████╗  ██║██╔════╝██╔══██╗██║    ██║
██║     ███████║███████║██║██╔██╗ ██║███████╗███████║██║ █╗ ██║
██║     ██╔══██║██╔══██║██║██║╚██╗██║╚════██║██╔══██║██║███╗██║
╚██████╗██║  ██║██║  ██║██║██║ ╚████║███████║██║  ██║╚███╔███╔╝
 ╚═════╝╚═╝  ╚═╝╚═╝  ╚═╝╚═╝╚═╝  ╚═══╝╚══════╝╚═╝  ╚═╝ ╚══╝╚══╝
    By WithSecure Countercept (@FranticTyping, @AlexKornitzer)
"
    );
}

fn init_writer(
    output: Option<PathBuf>,
    json: bool,
    jsonl: bool,
    quiet: bool,
    verbose: u8,
) -> Result<()> {
    let output_file = match &output {
        Some(path) => Some(File::create(path)?),
        None => None,
    };
    let format = if json {
        Format::Json
    } else if jsonl {
        Format::Jsonl
    } else {
        Format::Std
    };
    set_writer(Writer {
        format,
        output: output_file,
        path: output,
        quiet,
        verbose,
    })
}

fn parse_cli_timestamp(timestamp: &str) -> Result<NaiveDateTime> {
    parse_datetime(timestamp)
}

fn parse_timezone(timezone: &Option<String>) -> Result<Option<Tz>> {
    match timezone {
        Some(timezone) => Tz::from_str(timezone)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid timezone - {}", e)),
        None => Ok(None),
    }
}

fn load_rules(kind: &RuleKind, paths: &[PathBuf]) -> Result<Vec<chainsaw::rule::Rule>> {
    let mut rules = vec![];
    let extensions: Option<HashSet<String>> =
        Some(HashSet::from(["yml".to_string(), "yaml".to_string()]));
    for path in paths {
        for file in get_files(path, &extensions, false)? {
            let mut loaded = load(kind, &file).map_err(|e| {
                anyhow::anyhow!(
                    "failed to load rule '{}' - {}, run the linter for more information",
                    file.display(),
                    e
                )
            })?;
            rules.append(&mut loaded);
        }
    }
    Ok(rules)
}

fn document_to_value(document: file::Document) -> Value {
    match document {
        file::Document::Evtx(evtx) => evtx.data.into(),
        file::Document::Hve(hve) => hve.into(),
        file::Document::Json(json) => json.into(),
        file::Document::Mft(mft) => mft.into(),
        file::Document::Xml(xml) => xml.into(),
        file::Document::Esedb(esedb) => esedb.into(),
    }
}

fn run(args: Args) -> Result<()> {
    if let Some(threads) = args.num_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    match args.command {
        Command::Hunt {
            path,
            rule,
            sigma,
            mapping,
            from,
            to,
            local,
            timezone,
            json,
            jsonl,
            full,
            metadata,
            column_width,
            skip_errors,
            load_unknown,
            output,
        } => {
            init_writer(output, json, jsonl, args.quiet, args.verbose)?;
            if !args.no_banner {
                print_title();
            }
            let timezone = parse_timezone(&timezone)?;

            cs_eprintln!("[+] Loading detection rules...");
            let mut rules = load_rules(&RuleKind::Chainsaw, &rule)?;
            rules.append(&mut load_rules(&RuleKind::Sigma, &sigma)?);
            cs_eprintln!("[+] Loaded {} detection rules", rules.len());

            let mut hunter = Hunter::builder()
                .rules(rules)
                .mappings(mapping)
                .load_unknown(load_unknown)
                .local(local)
                .skip_errors(skip_errors);
            if let Some(timezone) = timezone {
                hunter = hunter.timezone(timezone);
            }
            if let Some(from) = &from {
                hunter = hunter.from(parse_cli_timestamp(from)?);
            }
            if let Some(to) = &to {
                hunter = hunter.to(parse_cli_timestamp(to)?);
            }
            let hunter = hunter.build()?;

            let extensions = Some(hunter.extensions());
            let mut files = vec![];
            for dir in &path {
                files.extend(get_files(dir, &extensions, skip_errors)?);
            }
            if files.is_empty() {
                anyhow::bail!("No compatible files were found in the provided paths");
            }

            let mut detections = vec![];
            let pb = cli::init_progress_bar(files.len() as u64, "Hunting".to_string());
            for file in &files {
                match hunter.hunt(file) {
                    Ok(mut found) => detections.append(&mut found),
                    Err(e) => {
                        if skip_errors {
                            cs_eyellowln!(
                                "[!] failed to hunt through file '{}' - {}",
                                file.display(),
                                e
                            );
                        } else {
                            anyhow::bail!("failed to hunt through file '{}' - {}", file.display(), e);
                        }
                    }
                }
                pb.inc(1);
            }
            pb.finish();

            if json {
                cli::print_json(&detections, hunter.hunts(), hunter.rules(), local, timezone)?;
            } else if jsonl {
                cli::print_jsonl(&detections, hunter.hunts(), hunter.rules(), local, timezone)?;
            } else {
                cli::print_detections(
                    &detections,
                    hunter.hunts(),
                    hunter.rules(),
                    column_width.unwrap_or(40),
                    full,
                    local,
                    metadata,
                    timezone,
                );
            }
            let count: usize = detections.iter().map(|d| d.hits.len()).sum();
            eprintln!("[+] {} detections in {} files", count, files.len());
        }
        Command::Search {
            path,
            pattern,
            tau,
            ignore_case,
            match_any,
            timestamp,
            from,
            to,
            local,
            timezone,
            json,
            jsonl,
            skip_errors,
            load_unknown,
            output,
        } => {
            init_writer(output, json, jsonl, args.quiet, args.verbose)?;
            if !args.no_banner {
                print_title();
            }
            let timezone = parse_timezone(&timezone)?;

            let mut searcher = Searcher::builder()
                .patterns(pattern)
                .tau(tau)
                .ignore_case(ignore_case)
                .load_unknown(load_unknown)
                .local(local)
                .match_any(match_any)
                .skip_errors(skip_errors);
            if let Some(timezone) = timezone {
                searcher = searcher.timezone(timezone);
            }
            if let Some(timestamp) = timestamp {
                searcher = searcher.timestamp(timestamp);
            }
            if let Some(from) = &from {
                searcher = searcher.from(parse_cli_timestamp(from)?);
            }
            if let Some(to) = &to {
                searcher = searcher.to(parse_cli_timestamp(to)?);
            }
            let searcher = searcher.build()?;

            let extensions = if load_unknown {
                None
            } else {
                Some(known_extensions())
            };
            let mut files = vec![];
            for dir in &path {
                files.extend(get_files(dir, &extensions, skip_errors)?);
            }
            if files.is_empty() {
                anyhow::bail!("No compatible files were found in the provided paths");
            }

            cs_eprintln!("[+] Searching...");
            let mut hits = 0;
            let mut renderer = cli::DocumentRenderer::new();
            for file in &files {
                let results = match searcher.search(file) {
                    Ok(results) => results,
                    Err(e) => {
                        if skip_errors {
                            cs_eyellowln!(
                                "[!] failed to search through file '{}' - {}",
                                file.display(),
                                e
                            );
                            continue;
                        }
                        anyhow::bail!(
                            "failed to search through file '{}' - {}",
                            file.display(),
                            e
                        );
                    }
                };
                for result in &results {
                    renderer.render(&result.data)?;
                }
                hits += results.len();
            }
            renderer.close()?;
            eprintln!("[+] {} hits in {} files", hits, files.len());
        }
        Command::Dump {
            path,
            extension,
            json,
            jsonl,
            skip_errors,
            load_unknown,
            output,
        } => {
            init_writer(output, json, jsonl, args.quiet, args.verbose)?;
            if !args.no_banner {
                print_title();
            }

            let extensions = if !extension.is_empty() {
                Some(
                    extension
                        .iter()
                        .map(|e| e.trim_start_matches('.').to_lowercase())
                        .collect::<HashSet<String>>(),
                )
            } else if load_unknown {
                None
            } else {
                Some(known_extensions())
            };
            let mut files = vec![];
            for dir in &path {
                files.extend(get_files(dir, &extensions, skip_errors)?);
            }
            if files.is_empty() {
                anyhow::bail!("No compatible files were found in the provided paths");
            }

            cs_eprintln!("[+] Dumping the contents of forensic artefacts...");
            let mut count = 0;
            let mut renderer = cli::DocumentRenderer::new();
            for file in &files {
                let mut reader = chainsaw::Reader::load(file, load_unknown, skip_errors)?;
                for document in reader.documents() {
                    let document = match document {
                        Ok(document) => document,
                        Err(e) => {
                            if skip_errors {
                                cs_eyellowln!(
                                    "[!] failed to parse document '{}' - {}",
                                    file.display(),
                                    e
                                );
                                continue;
                            }
                            anyhow::bail!("{} in {}", e, file.display());
                        }
                    };
                    renderer.render(&document_to_value(document))?;
                    count += 1;
                }
            }
            renderer.close()?;
            eprintln!("[+] {} documents in {} files", count, files.len());
        }
        Command::Lint { path, kind, tau } => {
            init_writer(None, false, false, args.quiet, args.verbose)?;
            if !args.no_banner {
                print_title();
            }
            let kind = RuleKind::from_str(&kind)?;
            cs_eprintln!("[+] Validating as {} for supplied detection rules...", kind);
            let mut count = 0;
            let mut failed = 0;
            for file in get_files(&path, &None, false)? {
                match lint(&kind, &file) {
                    Ok(filters) => {
                        count += 1;
                        if tau {
                            for filter in filters {
                                match filter {
                                    Filter::Detection(detection) => {
                                        let expression = optimiser::coalesce(
                                            detection.expression,
                                            &detection.identifiers,
                                        );
                                        let expression = optimiser::shake(expression);
                                        let expression = optimiser::rewrite(expression);
                                        let expression = optimiser::matrix(expression);
                                        let yaml = serde_yaml::to_string(&expression.to_yaml())?;
                                        cs_println!("---");
                                        cs_println!("{}", yaml.trim_end());
                                    }
                                    Filter::Expression(_) => {
                                        cs_eyellowln!(
                                            "[!] tau does not support visual representation of expressions"
                                        );
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        let name = file
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| file.display().to_string());
                        cs_eyellowln!("[!] {}: {}", name, e);
                    }
                }
            }
            cs_egreenln!(
                "[+] Validated {} detection rules out of {}",
                count,
                count + failed
            );
        }
        Command::Analyse { command } => match command {
            AnalyseCommand::Shimcache {
                shimcache,
                amcache,
                regex,
                regex_file,
                tspair,
                output,
            } => {
                init_writer(output, false, false, args.quiet, args.verbose)?;
                if !args.no_banner {
                    print_title();
                }
                let mut patterns = regex;
                if let Some(regex_file) = regex_file {
                    let contents = std::fs::read_to_string(&regex_file)?;
                    for line in contents.lines() {
                        let line = line.trim();
                        if !line.is_empty() {
                            patterns.push(line.to_owned());
                        }
                    }
                }
                let analyser = ShimcacheAnalyser::new(shimcache, amcache);
                let timeline = analyser.amcache_shimcache_timeline(&patterns, tspair)?;
                cli::print_shimcache_timeline(&timeline)?;
            }
            AnalyseCommand::Srum {
                srum,
                software,
                stats_only,
                output,
            } => {
                init_writer(output, false, false, args.quiet, args.verbose)?;
                if !args.no_banner {
                    print_title();
                }
                let analyser = SrumAnalyser::new(srum, software);
                let info = analyser.parse_srum_database()?;
                cli::print_srum_database_info(&info, stats_only)?;
            }
        },
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        cs_eredln!("[x] {}", e);
        std::process::exit(1);
    }
}
