//! Rendering of a [`Rates`] table
//!
//! Families are listed alphabetically and tables within a family by
//! descending average latency.

use std::{collections::BTreeMap, io};

use serde::Serialize;

use crate::delta::{Rate, Rates};

const HORIZ_LINE: &str = "--------------------------------------------------------------------------------";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
/// Output format of the report
pub enum Format {
    /// Fixed-width text table per family
    #[default]
    Table,
    /// A single JSON document
    Json,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    interval_seconds: u64,
    rates: BTreeMap<&'a str, BTreeMap<&'a str, &'a Rate>>,
}

/// Families in alphabetical order, each with its entries sorted by
/// descending average. Equal averages are ordered by label value.
#[must_use]
pub fn sorted(rates: &Rates) -> Vec<(&str, Vec<(&str, &Rate)>)> {
    let mut families: Vec<(&str, Vec<(&str, &Rate)>)> = rates
        .iter()
        .map(|(family, entries)| {
            let mut entries: Vec<(&str, &Rate)> = entries
                .iter()
                .map(|(label, rate)| (label.as_str(), rate))
                .collect();
            entries.sort_by(|(la, a), (lb, b)| {
                b.average.total_cmp(&a.average).then_with(|| la.cmp(lb))
            });
            (family.as_str(), entries)
        })
        .collect();
    families.sort_by(|(a, _), (b, _)| a.cmp(b));
    families
}

/// Write `rates` in `format`.
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn render<W: io::Write>(
    out: &mut W,
    format: Format,
    interval_seconds: u64,
    rates: &Rates,
) -> io::Result<()> {
    match format {
        Format::Table => render_table(out, interval_seconds, rates),
        Format::Json => render_json(out, interval_seconds, rates),
    }
}

/// Write `rates` as one fixed-width table per family.
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn render_table<W: io::Write>(
    out: &mut W,
    interval_seconds: u64,
    rates: &Rates,
) -> io::Result<()> {
    writeln!(out, "TIME INTERVAL: {interval_seconds}")?;
    for (family, entries) in sorted(rates) {
        writeln!(out, "{HORIZ_LINE}")?;
        writeln!(out, "{family}")?;
        writeln!(out, "{HORIZ_LINE}")?;
        writeln!(out, "{:<20} {:<10} {:<10} {:<17}", "TABLE", "SUM", "COUNT", "RATE")?;
        writeln!(out, "{HORIZ_LINE}")?;
        for (label, rate) in entries {
            writeln!(
                out,
                "{:<20} {:<10} {:<10} {:<10.6}",
                label, rate.sum_delta, rate.count_delta, rate.average
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Write `rates` as a JSON object keyed by family then label value.
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn render_json<W: io::Write>(
    out: &mut W,
    interval_seconds: u64,
    rates: &Rates,
) -> io::Result<()> {
    let report = JsonReport {
        interval_seconds,
        rates: rates
            .iter()
            .map(|(family, entries)| {
                let entries = entries
                    .iter()
                    .map(|(label, rate)| (label.as_str(), rate))
                    .collect();
                (family.as_str(), entries)
            })
            .collect(),
    };
    serde_json::to_writer_pretty(&mut *out, &report)?;
    writeln!(out)
}
