// Copyright (c) Facebook, Inc. and its affiliates.
use clap::{App, AppSettings, ArgMatches};
use log::error;
use serde::{Deserialize, Serialize};
use std::process::exit;
use std::str::FromStr;

use resctrl_util::*;

pub const ALL_TESTS: [&str; 4] = ["mbm", "mba", "cqm", "cat"];
pub const DFL_RESCTRL_PATH: &str = "/sys/fs/resctrl";

lazy_static::lazy_static! {
    static ref ARGS_STR: String = {
        let dfl_args = Args::default();
        format!(
            "-t, --tests=[LIST]            'Comma separated test categories to run (default: {dfl_tests})'
             -n, --bits=[NR]               'Number of cache bitmask bits for cache tests (default: {dfl_bits})'
             -p, --cpu=[CPU]               'CPU to run the benchmark on (default: {dfl_cpu})'
             -s, --span=[SIZE]             'Memory touched by fill-buf per pass (default: {dfl_span})'
             -r, --result=[FILE]           'Write verdict reports to FILE'
             -P, --params=[FILE]           'Tunables, will be created with defaults if non-existent'
             -a, --args=[FILE]             'Load base command line arguments from FILE'
                 --resctrl=[PATH]          'resctrl mount point (default: {dfl_resctrl})'
                 --no-remount              'Use an existing resctrl mount as-is'
                 --keep-mounted            'Leave resctrl mounted on exit'
             -v...                         'Sets the level of verbosity'",
            dfl_tests = ALL_TESTS.join(","),
            dfl_bits = dfl_args.nr_bits,
            dfl_cpu = dfl_args.cpu,
            dfl_span = format_size(dfl_args.span),
            dfl_resctrl = DFL_RESCTRL_PATH,
        )
    };
}

const ARGS_DOC: &str = "\
//
// resctrl-selftest command line arguments
//
// This file provides the base values for a subset of command line arguments.
// They can be overridden from command line.
//
";

const AFTER_HELP: &str = "\
Everything after -b is taken as the benchmark command line which replaces
the built-in fill-buf workload, e.g.:

  resctrl-selftest -t mbm,mba -b stress-ng --stream 1
";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub tests: Vec<String>,
    pub nr_bits: u32,
    pub cpu: u32,
    pub span: u64,
    pub result: Option<String>,
    pub params: Option<String>,
    pub resctrl: String,
    pub benchmark: Option<Vec<String>>,

    #[serde(skip)]
    pub remount: bool,
    #[serde(skip)]
    pub keep_mounted: bool,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            tests: ALL_TESTS.iter().map(|x| x.to_string()).collect(),
            nr_bits: 5,
            cpu: 1,
            span: 250 * MB,
            result: None,
            params: None,
            resctrl: DFL_RESCTRL_PATH.into(),
            benchmark: None,
            remount: true,
            keep_mounted: false,
            verbosity: 0,
        }
    }
}

impl Args {
    /// `-b` swallows the rest of the command line so that the benchmark's own
    /// flags never reach our parser.
    pub fn split_benchmark_cmd(argv: Vec<String>) -> (Vec<String>, Option<Vec<String>>) {
        match argv.iter().position(|x| x == "-b") {
            Some(idx) => {
                let bench = argv[idx + 1..].to_vec();
                (argv[..idx].to_vec(), Some(bench))
            }
            None => (argv, None),
        }
    }

    pub fn parse_tests(input: &str) -> Result<Vec<String>, String> {
        let mut tests = vec![];
        for tok in input.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
            if !ALL_TESTS.contains(&tok) {
                return Err(format!("unknown test {:?}", tok));
            }
            if !tests.iter().any(|x| x == tok) {
                tests.push(tok.to_string());
            }
        }
        if tests.is_empty() {
            return Err(format!("no test selected by {:?}", input));
        }
        Ok(tests)
    }
}

fn parse_or_exit<T: FromStr>(key: &str, v: &str) -> T
where
    T::Err: std::fmt::Display,
{
    match v.parse::<T>() {
        Ok(v) => v,
        Err(e) => {
            error!("Invalid --{} {:?} ({})", key, v, &e);
            exit(1);
        }
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some(ARGS_DOC.to_string())
    }
}

impl JsonArgs for Args {
    #[allow(dangerous_implicit_autorefs)]
    fn match_cmdline(argv: &[String]) -> ArgMatches<'static> {
        App::new("resctrl-selftest")
            .version(*super::VERSION)
            .author(clap::crate_authors!("\n"))
            .about("Validates resctrl cache and memory bandwidth allocation and monitoring")
            .after_help(AFTER_HELP)
            .args_from_usage(&ARGS_STR)
            .setting(AppSettings::UnifiedHelpMessage)
            .setting(AppSettings::DeriveDisplayOrder)
            .get_matches_from(argv)
    }

    fn verbosity(matches: &ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &ArgMatches) -> bool {
        let dfl: Args = Default::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("tests") {
            self.tests = if !v.is_empty() {
                match Self::parse_tests(v) {
                    Ok(tests) => tests,
                    Err(e) => {
                        error!("Invalid --tests ({})", &e);
                        exit(1);
                    }
                }
            } else {
                dfl.tests.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("bits") {
            self.nr_bits = if !v.is_empty() {
                parse_or_exit("bits", v)
            } else {
                dfl.nr_bits
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("cpu") {
            self.cpu = if !v.is_empty() {
                parse_or_exit("cpu", v)
            } else {
                dfl.cpu
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("span") {
            self.span = if !v.is_empty() {
                match parse_size(v) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("Invalid --span {:?} ({:#})", v, &e);
                        exit(1);
                    }
                }
            } else {
                dfl.span
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("result") {
            self.result = if !v.is_empty() {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("params") {
            self.params = if !v.is_empty() {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("resctrl") {
            self.resctrl = if !v.is_empty() {
                v.to_string()
            } else {
                dfl.resctrl.clone()
            };
            updated_base = true;
        }

        self.remount = !matches.is_present("no-remount");
        self.keep_mounted = matches.is_present("keep-mounted");
        self.verbosity = Self::verbosity(matches);

        updated_base
    }
}

#[cfg(test)]
mod tests {
    use super::Args;

    fn argv(input: &[&str]) -> Vec<String> {
        input.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_split_benchmark_cmd() {
        let (front, bench) =
            Args::split_benchmark_cmd(argv(&["rs", "-t", "mbm", "-b", "stress", "-b", "1"]));
        assert_eq!(front, argv(&["rs", "-t", "mbm"]));
        assert_eq!(bench, Some(argv(&["stress", "-b", "1"])));

        let (front, bench) = Args::split_benchmark_cmd(argv(&["rs", "-p", "3"]));
        assert_eq!(front, argv(&["rs", "-p", "3"]));
        assert_eq!(bench, None);
    }

    #[test]
    fn test_parse_tests() {
        assert_eq!(
            Args::parse_tests("mba, cat,mba").unwrap(),
            argv(&["mba", "cat"])
        );
        assert!(Args::parse_tests("mbm,foo").is_err());
        assert!(Args::parse_tests(",").is_err());
    }
}
