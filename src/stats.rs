use burn::tensor::cast::ToElement;
use burn::tensor::{Tensor, backend::Backend};
use chrono::Utc;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

/// Running loss accumulator of the training loop.
///
/// Prints a carriage return progress line per iteration and appends the last line of every
/// phase to a log file when flushed.
pub struct Stats {
    stopwatch: Instant,
    batch_size: usize,
    loc: f32,
    cls: f32,
    log_output: String,
    f_handle: File,
}

impl Stats {
    pub fn new<P: AsRef<Path>>(batch_size: usize, log_path: P) -> io::Result<Self> {
        if let Some(dir) = log_path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }

        let f_handle = File::options().create(true).append(true).open(log_path)?;
        let now = Utc::now();

        writeln!(&f_handle, "\n----{}----\n", now.format("%Y-%m-%d %H:%M:%S"))?;

        Ok(Stats {
            stopwatch: Instant::now(),
            batch_size,
            loc: 0.0,
            cls: 0.0,
            log_output: String::new(),
            f_handle,
        })
    }

    /// Adds the losses of iteration `iteration` (0-based) and refreshes the progress line.
    pub fn update<B: Backend>(
        &mut self,
        loc_loss: Tensor<B, 1>,
        cls_loss: Tensor<B, 1>,
        iteration: usize,
        name: &str,
        epoch: usize,
    ) -> io::Result<()> {
        let seen = iteration + 1;

        self.loc += loc_loss.into_scalar().to_f32();
        self.cls += cls_loss.into_scalar().to_f32();

        let elapsed = self.stopwatch.elapsed().as_secs();

        self.log_output = format!(
            "{},E:{:<6},I:{:<8},Loc:{:<8.4},Cls:{:<8.4},T:{:<}m{:<}s\r",
            name,
            epoch,
            seen * self.batch_size,
            self.loc / seen as f32,
            self.cls / seen as f32,
            (elapsed / 60),
            elapsed % 60
        );

        print!("{}", &self.log_output);
        io::stdout().flush()
    }

    /// Ends a phase: writes the last progress line to the log and resets the accumulators.
    pub fn flush(&mut self) -> io::Result<()> {
        let line = self.log_output.trim_end_matches('\r');
        writeln!(self.f_handle, "{}", line)?;
        log::info!("{}", line);

        self.stopwatch = Instant::now();
        self.loc = 0.0;
        self.cls = 0.0;
        self.log_output.clear();
        println!();

        Ok(())
    }
}
