//! CSV output files under the working directory.
//!
//! Everything lands in `./csvs/`: one process-wide monitoring file, one
//! process-wide progress file, and one measurement plus one prediction
//! file per discovered region, named by zero-padded region id. Writers are
//! line-buffered so each record is durable as soon as its newline goes
//! out, even though the shim never gets an orderly shutdown.

use std::fs::{self, File};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};

/// Default output root, relative to the host's working directory.
pub const OUTPUT_ROOT: &str = "./csvs";

pub const MEASUREMENTS_DIR: &str = "measurements";
pub const PREDICTIONS_DIR: &str = "predictions";

/// Header of the progress file: region id plus the ten feature columns.
pub const PROGRESS_HEADER: &str = "Functions,Metrics,,,,,,,,,";

/// File name for one region's stream: zero-padded to at least two digits.
pub fn region_file_name(id: u64) -> String {
    format!("{:02}.csv", id)
}

/// Create the output directory tree.
pub fn create_tree(root: &Path) -> io::Result<()> {
    fs::create_dir_all(root.join(MEASUREMENTS_DIR))?;
    fs::create_dir_all(root.join(PREDICTIONS_DIR))?;
    Ok(())
}

/// Create a line-buffered CSV file without writing anything to it.
pub fn create_file(path: PathBuf) -> io::Result<LineWriter<File>> {
    Ok(LineWriter::new(File::create(path)?))
}

/// Create a line-buffered CSV file and write its header line.
pub fn create_with_header(path: PathBuf, header: &str) -> io::Result<LineWriter<File>> {
    let mut writer = create_file(path)?;
    writeln!(writer, "{}", header)?;
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_ids_are_zero_padded_to_two_digits() {
        assert_eq!(region_file_name(1), "01.csv");
        assert_eq!(region_file_name(9), "09.csv");
        assert_eq!(region_file_name(10), "10.csv");
        assert_eq!(region_file_name(123), "123.csv");
    }

    #[test]
    fn header_goes_out_on_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let writer = create_with_header(path.clone(), PROGRESS_HEADER).unwrap();
        drop(writer);
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "Functions,Metrics,,,,,,,,,\n"
        );
    }
}
