use std::io::{self, Write};

use serde::Serialize;

use crate::app::{InspectResult, ProjectResult, StudiesResult, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(result: &SyncResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_studies(result: &StudiesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_inspect(result: &InspectResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_project(result: &ProjectResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Plain-text summaries for terminal use.
pub struct HumanOutput;

impl HumanOutput {
    pub fn print_sync(result: &SyncResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        write_sync(&mut stdout, result)
    }

    pub fn print_studies(result: &StudiesResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        if result.studies.is_empty() {
            return writeln!(stdout, "no studies registered");
        }
        for study in &result.studies {
            writeln!(
                stdout,
                "{:>4}  {:<32} files {}/{} indexed  samples {}  cohorts {}",
                study.id, study.name, study.indexed_files, study.files, study.samples, study.cohorts
            )?;
        }
        Ok(())
    }

    pub fn print_project(result: &ProjectResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "project {}: species {} assembly {} release {}",
            result.project,
            result.metadata.species,
            result.metadata.assembly,
            result.metadata.release
        )
    }
}

fn write_sync(out: &mut impl Write, result: &SyncResult) -> io::Result<()> {
    let report = &result.report;
    let scope = result.study.as_deref().unwrap_or("all studies");
    writeln!(
        out,
        "sync {} ({scope}): {}",
        result.command,
        if report.modified { "catalog updated" } else { "already in sync" }
    )?;
    writeln!(
        out,
        "  files {}  samples {}  cohorts {}  missing in catalog {}  skipped after failure {}",
        report.files_updated,
        report.samples_updated,
        report.cohorts_updated,
        report.missing_in_catalog,
        report.tolerated_failures
    )
}
