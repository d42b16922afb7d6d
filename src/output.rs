use std::io::Write;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Args, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("CSV headers must precede all records")]
    LateCsvHeaders,
}

impl Args {
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn to_output(self) -> Result<Output, Error> {
        let io: Box<dyn Write> = match &self.output {
            None => Box::new(std::io::stdout().lock()),
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ),
        };
        Ok(Output::new(self.format, io, self.output))
    }
}

/// Sink for command results, rendered in the requested [`Format`].
///
/// Tables are buffered until [`Output::flush`] or [`Output::commit`], the other formats are
/// streamed.
pub struct Output<W: Write = Box<dyn Write>> {
    destination: Option<PathBuf>,
    io: W,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table, headers: Vec<&'static str> },
    Jsonl,
}

fn new_table(headers: &[&'static str]) -> comfy_table::Table {
    let mut comfy = comfy_table::Table::new();
    comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    if !headers.is_empty() {
        comfy.set_header(headers.to_vec());
    }
    comfy
}

impl<W: Write> Output<W> {
    pub fn new(format: Format, io: W, destination: Option<PathBuf>) -> Self {
        let formatter = match format {
            Format::Table => Formatter::Table { comfy: new_table(&[]), headers: Vec::new() },
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Self { destination, io, formatter }
    }

    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    return Err(Error::LateCsvHeaders);
                }
                *written_records = true;
                self.write_csv_row(&hdrs)?;
            }
            Formatter::Table { comfy, headers } => {
                comfy.set_header(hdrs.clone());
                *headers = hdrs;
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let mut buffer = [0; 256];
        let mut writer = csv_core::Writer::new();
        for (i, value) in values.iter().enumerate() {
            if i != 0 {
                let (_, n) = writer.delimiter(&mut buffer);
                self.io.write_all(&buffer[..n]).map_err(|e| self.write_error(e))?;
            }
            let mut input = value.as_ref().as_bytes();
            loop {
                let (result, read, written) = writer.field(input, &mut buffer);
                input = &input[read..];
                self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))?;
                if let WriteResult::InputEmpty = result {
                    break;
                }
            }
        }
        loop {
            let (result, written) = writer.terminator(&mut buffer);
            self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))?;
            if let WriteResult::InputEmpty = result {
                return Ok(());
            }
        }
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy, .. } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.destination {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    /// Emit everything produced so far. A table is printed and a new one with the same headers
    /// is started.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy, headers } = &mut self.formatter {
            let table = std::mem::replace(comfy, new_table(headers));
            writeln!(self.io, "{table}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    pub fn commit(mut self) -> Result<W, Error> {
        self.flush()?;
        Ok(self.io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(format: Format) -> String {
        let mut output = Output::new(format, Vec::new(), None);
        output.table_headers(vec!["name", "value"]).unwrap();
        output
            .result(
                || vec!["SYSTEM_MODE".into(), "say \"hi\", twice".into()],
                || serde_json::json!({ "name": "SYSTEM_MODE", "value": 2 }),
            )
            .unwrap();
        String::from_utf8(output.commit().unwrap()).unwrap()
    }

    #[test]
    fn csv_quotes_fields() {
        assert_eq!(render(Format::Csv), "name,value\nSYSTEM_MODE,\"say \"\"hi\"\", twice\"\n");
    }

    #[test]
    fn jsonl_skips_headers() {
        assert_eq!(render(Format::Jsonl), "{\"name\":\"SYSTEM_MODE\",\"value\":2}\n");
    }

    #[test]
    fn table_contains_rows() {
        let table = render(Format::Table);
        assert!(table.contains("name"));
        assert!(table.contains("SYSTEM_MODE"));
    }

    #[test]
    fn csv_headers_come_first() {
        let mut output = Output::new(Format::Csv, Vec::new(), None);
        output.result(|| vec!["1".into()], || 1).unwrap();
        assert!(matches!(output.table_headers(vec!["a"]), Err(Error::LateCsvHeaders)));
    }

    #[test]
    fn flushed_tables_keep_headers() {
        let mut output = Output::new(Format::Table, Vec::new(), None);
        output.table_headers(vec!["register"]).unwrap();
        output.result(|| vec!["first".into()], || ()).unwrap();
        output.flush().unwrap();
        output.result(|| vec!["second".into()], || ()).unwrap();
        let text = String::from_utf8(output.commit().unwrap()).unwrap();
        assert_eq!(text.matches("register").count(), 2);
        assert!(text.find("first") < text.find("second"));
    }
}
