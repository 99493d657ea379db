//! Periodic table of pending commands on smart terminals.
//!
//! [`StatusTable`] tracks every in-flight command and, on each update, paints
//! the K oldest ones below the status line using ANSI sequences. Since ANSI
//! save/restore-cursor sequences do not work reliably across terminal
//! emulators, every update repaints the status line to reposition the cursor
//! instead.
//!
//! Usage:
//!
//! 1. Create an instance with a [`StatusTableConfig`].
//! 2. Call [`StatusTable::build_started`] / [`StatusTable::build_ended`]
//!    around the build.
//! 3. Call [`StatusTable::command_started`] / [`StatusTable::command_ended`]
//!    as commands come and go; `command` is any key unique to the command
//!    (the supervisor's subprocess token works well).
//! 4. Call [`StatusTable::update`] whenever some time has passed, and
//!    [`StatusTable::set_status`] whenever the status line changes.
//! 5. Call [`StatusTable::clear_table`] before printing command output or
//!    handing the terminal to a console command.
//!
//! All timestamps are milliseconds relative to an arbitrary per-build epoch.

use std::collections::HashMap;
use std::io::Write;

use tracing::trace;

/// Configuration for a [`StatusTable`].
#[derive(Debug, Clone, Copy)]
pub struct StatusTableConfig {
    /// Maximum number of commands to print. Zero disables the table.
    pub max_commands: usize,
    /// Minimum spacing between terminal updates, in milliseconds.
    pub refresh_timeout_ms: i64,
}

impl Default for StatusTableConfig {
    fn default() -> Self {
        StatusTableConfig {
            max_commands: 0,
            refresh_timeout_ms: 100,
        }
    }
}

/// Low-level terminal operations used by [`StatusTable`].
///
/// The provided [`AnsiTablePrinter`] emits ANSI sequences on stdout; tests
/// substitute an implementation that logs calls instead.
pub trait TablePrinter {
    /// Print `line` from the start of the current line, clearing anything
    /// after it. Must not move the cursor to the next line.
    fn print_on_current_line(&mut self, line: &str);

    /// Jump to the next line, then print `line` like
    /// [`TablePrinter::print_on_current_line`].
    fn print_on_next_line(&mut self, line: &str);

    /// Move down one line and clear it completely, keeping the column.
    fn clear_next_line(&mut self);

    /// Move up `lines` lines, keeping the column.
    fn move_up(&mut self, lines: usize);

    /// Flush everything to the terminal.
    fn flush(&mut self);
}

/// [`TablePrinter`] writing ANSI sequences to stdout.
pub struct AnsiTablePrinter {
    out: std::io::Stdout,
}

impl Default for AnsiTablePrinter {
    fn default() -> Self {
        AnsiTablePrinter {
            out: std::io::stdout(),
        }
    }
}

impl TablePrinter for AnsiTablePrinter {
    fn print_on_current_line(&mut self, line: &str) {
        // "\x1B[0K" erases from the cursor to the end of the line.
        let _ = write!(self.out, "{line}\x1B[0K");
    }

    fn print_on_next_line(&mut self, line: &str) {
        let _ = writeln!(self.out);
        self.print_on_current_line(line);
    }

    fn clear_next_line(&mut self) {
        // Down one line, then clear the whole line.
        let _ = write!(self.out, "\x1B[1B\x1B[2K");
    }

    fn move_up(&mut self, lines: usize) {
        let _ = write!(self.out, "\x1B[{lines}A");
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

#[derive(Debug)]
struct CommandValue {
    start_time_ms: i64,
    /// Monotonic insertion id. Commands frequently start with identical
    /// timestamps; the id guarantees a stable display order for them.
    command_id: u64,
    description: String,
}

/// Renders the oldest pending commands below the status line.
pub struct StatusTable<P: TablePrinter = AnsiTablePrinter> {
    config: StatusTableConfig,
    printer: P,
    /// Commands started and not yet ended, keyed by the caller's command key.
    pending_commands: HashMap<u64, CommandValue>,
    last_command_id: u64,
    /// Number of table lines printed by the previous update.
    last_command_count: usize,
    /// Timestamp of the last table update; None right after build start.
    last_update_time_ms: Option<i64>,
    last_status: String,
}

impl StatusTable<AnsiTablePrinter> {
    /// Create a table printing to stdout.
    pub fn new(config: StatusTableConfig) -> Self {
        StatusTable::with_printer(config, AnsiTablePrinter::default())
    }
}

impl<P: TablePrinter> StatusTable<P> {
    /// Create a table emitting through a custom printer.
    pub fn with_printer(config: StatusTableConfig, printer: P) -> Self {
        StatusTable {
            config,
            printer,
            pending_commands: HashMap::new(),
            last_command_id: 0,
            last_command_count: 0,
            last_update_time_ms: None,
            last_status: String::new(),
        }
    }

    /// Set or update the status line repainted on top of the table. Must be
    /// called at least once before [`StatusTable::update`].
    pub fn set_status(&mut self, status: &str) {
        self.last_status.clear();
        self.last_status.push_str(status);
    }

    /// Call when a new build starts.
    pub fn build_started(&mut self) {
        self.last_update_time_ms = None;
        self.last_command_id = 0;
    }

    /// Call when the build completes. Clears the table.
    pub fn build_ended(&mut self) {
        self.last_update_time_ms = None;
        self.clear_table();
    }

    /// Record a newly started command. `command` is an opaque key unique to
    /// it; `start_time_ms` is its start time relative to the build epoch.
    /// Starting the same key twice without an intervening end is a defect.
    pub fn command_started(&mut self, command: u64, start_time_ms: i64, description: String) {
        self.last_command_id += 1;
        let previous = self.pending_commands.insert(
            command,
            CommandValue {
                start_time_ms,
                command_id: self.last_command_id,
                description,
            },
        );
        debug_assert!(previous.is_none(), "command {command} started twice");
    }

    /// Record a command completion. Does not update the terminal. Ending a
    /// key that was never started is a defect.
    pub fn command_ended(&mut self, command: u64) {
        let removed = self.pending_commands.remove(&command);
        debug_assert!(removed.is_some(), "command {command} ended twice");
    }

    /// Update the table after some time has passed. Respects the configured
    /// refresh spacing; too-early calls print nothing.
    pub fn update(&mut self, build_time_ms: i64) {
        if let Some(last_update_ms) = self.last_update_time_ms {
            if build_time_ms - last_update_ms < self.config.refresh_timeout_ms {
                // No need to update more than necessary when commands
                // complete really fast.
                return;
            }
        }
        self.last_update_time_ms = Some(build_time_ms);
        self.print_pending(build_time_ms);
    }

    /// Erase every previously printed table line, moving the cursor back up
    /// without reprinting the status.
    pub fn clear_table(&mut self) {
        if self.last_command_count == 0 {
            return;
        }
        for _ in 0..self.last_command_count {
            self.printer.clear_next_line();
        }
        self.printer.move_up(self.last_command_count);
        self.printer.flush();
        self.last_command_count = 0;
    }

    fn print_pending(&mut self, build_time_ms: i64) {
        let max_commands = self.config.max_commands;
        if max_commands == 0 {
            return;
        }

        // Select the |max_commands| oldest pending commands with a bounded
        // max-queue seeded with None sentinels: a candidate replaces the
        // current maximum when it sorts before it by (start time, insertion
        // id). The full key decides both selection and display order, so
        // equal start times resolve to the lowest insertion ids no matter
        // what order the pending map yields the candidates in.
        let mut oldest: BoundedMaxQueue<'_> = BoundedMaxQueue::with_size(max_commands);
        for command in self.pending_commands.values() {
            oldest.offer(command);
        }
        // Drain yields newest first; render in reverse for oldest-first.
        let older_commands = oldest.into_sorted_oldest_first();

        trace!(
            pending = self.pending_commands.len(),
            shown = older_commands.len(),
            "status table update"
        );

        for command in &older_commands {
            let elapsed_ms = build_time_ms - command.start_time_ms;
            let elapsed = if elapsed_ms < 0 {
                // Clock skew between the caller's timestamps.
                "??????".to_string()
            } else if elapsed_ms < 60_000 {
                format!("{}.{}s", elapsed_ms / 1000, (elapsed_ms % 1000) / 100)
            } else {
                format!("{}m{}s", elapsed_ms / 60_000, (elapsed_ms % 60_000) / 1000)
            };
            // Right-justify the elapsed time to six columns, never truncating.
            self.printer
                .print_on_next_line(&format!("{elapsed:>6} | {}", command.description));
        }

        // Clear previous lines that are not needed anymore.
        let next_height = older_commands.len();
        let mut count = next_height;
        while count < self.last_command_count {
            self.printer.clear_next_line();
            count += 1;
        }

        if count > 0 {
            // Reposition by moving up and repainting the status line.
            self.printer.move_up(count);
            self.printer.print_on_current_line(&self.last_status);
        }
        self.printer.flush();

        self.last_command_count = next_height;
    }
}

/// Fixed-size max-queue over pending commands, ordered by
/// `(start_time_ms, command_id)` with `None` sentinels sorting last.
/// `max_commands` is small, so the queue is a plain slot array scanned
/// linearly rather than a real heap.
struct BoundedMaxQueue<'a> {
    entries: Vec<Option<&'a CommandValue>>,
}

impl<'a> BoundedMaxQueue<'a> {
    fn with_size(size: usize) -> Self {
        BoundedMaxQueue {
            entries: vec![None; size],
        }
    }

    fn sort_key(entry: Option<&CommandValue>) -> (i64, u64) {
        // Sentinels sort strictly after every real command.
        entry.map_or((i64::MAX, u64::MAX), |cmd| {
            (cmd.start_time_ms, cmd.command_id)
        })
    }

    fn top_index(&self) -> usize {
        let mut top = 0;
        for (index, entry) in self.entries.iter().enumerate().skip(1) {
            if Self::sort_key(*entry) > Self::sort_key(self.entries[top]) {
                top = index;
            }
        }
        top
    }

    /// Replace the current maximum with `candidate` when the candidate
    /// sorts before it by `(start_time_ms, command_id)`; ignore it
    /// otherwise. Comparing the full key (not just the start time) keeps
    /// the surviving set independent of the order candidates arrive in,
    /// so ties on start time always resolve to the lowest insertion ids.
    fn offer(&mut self, candidate: &'a CommandValue) {
        let top = self.top_index();
        if (candidate.start_time_ms, candidate.command_id) < Self::sort_key(self.entries[top]) {
            self.entries[top] = Some(candidate);
        }
    }

    fn into_sorted_oldest_first(self) -> Vec<&'a CommandValue> {
        let mut selected: Vec<&CommandValue> = self.entries.into_iter().flatten().collect();
        selected.sort_by_key(|cmd| (cmd.start_time_ms, cmd.command_id));
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    /// Printer that appends every call to a log string.
    #[derive(Default)]
    struct LoggingPrinter {
        log: String,
    }

    impl TablePrinter for LoggingPrinter {
        fn print_on_current_line(&mut self, line: &str) {
            let _ = writeln!(self.log, "PrintOnCurrentLine({line})");
        }
        fn print_on_next_line(&mut self, line: &str) {
            let _ = writeln!(self.log, "PrintOnNextLine({line})");
        }
        fn clear_next_line(&mut self) {
            self.log.push_str("ClearNextLine()\n");
        }
        fn move_up(&mut self, lines: usize) {
            let _ = writeln!(self.log, "MoveUp({lines})");
        }
        fn flush(&mut self) {
            self.log.push_str("Flush()\n");
        }
    }

    fn test_table(max_commands: usize) -> StatusTable<LoggingPrinter> {
        StatusTable::with_printer(
            StatusTableConfig {
                max_commands,
                refresh_timeout_ms: 100,
            },
            LoggingPrinter::default(),
        )
    }

    impl StatusTable<LoggingPrinter> {
        /// Return the accumulated log and clear it.
        fn log(&mut self) -> String {
            std::mem::take(&mut self.printer.log)
        }
    }

    fn description(command: u64) -> String {
        format!("command_{command}")
    }

    #[test]
    fn test_no_commands_when_disabled() {
        let mut table = test_table(0);
        assert_eq!(table.log(), "");

        table.set_status("some_status");
        table.build_started();

        table.command_started(1, 0, description(1));
        table.command_started(2, 0, description(2));
        table.command_started(3, 0, description(3));
        table.update(0);
        assert_eq!(table.log(), "");

        table.command_ended(2);
        table.command_ended(3);
        table.update(500);
        assert_eq!(table.log(), "");

        table.command_ended(1);
        table.build_ended();
        assert_eq!(table.log(), "");
    }

    #[test]
    fn test_two_commands_no_periodic_updates() {
        let mut table = test_table(2);
        table.set_status("some_status");
        table.build_started();

        table.command_started(1, 0, description(1));
        table.command_started(2, 250, description(2));
        table.command_started(3, 570, description(3));
        table.update(570);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.5s | command_1)\n\
             PrintOnNextLine(  0.3s | command_2)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.command_ended(1);
        table.update(670);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.4s | command_2)\n\
             PrintOnNextLine(  0.1s | command_3)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.command_ended(2);
        table.update(1070);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.5s | command_3)\n\
             ClearNextLine()\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.command_ended(3);
        table.update(1270);
        assert_eq!(
            table.log(),
            "ClearNextLine()\n\
             MoveUp(1)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.build_ended();
        table.update(1270);
        assert_eq!(table.log(), "Flush()\n");
    }

    #[test]
    fn test_two_commands_with_periodic_updates() {
        let mut table = test_table(2);
        table.set_status("some_status");
        table.build_started();

        table.command_started(1, 0, description(1));
        table.command_started(2, 250, description(2));
        table.command_started(3, 570, description(3));
        table.update(570);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.5s | command_1)\n\
             PrintOnNextLine(  0.3s | command_2)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        // Not enough time has passed: no update at all.
        table.update(620);
        assert_eq!(table.log(), "");

        table.update(670);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.6s | command_1)\n\
             PrintOnNextLine(  0.4s | command_2)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.update(770);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.7s | command_1)\n\
             PrintOnNextLine(  0.5s | command_2)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.command_ended(1);
        table.update(870);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.6s | command_2)\n\
             PrintOnNextLine(  0.3s | command_3)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.command_ended(2);
        table.update(1270);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.7s | command_3)\n\
             ClearNextLine()\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.command_ended(3);
        table.update(1370);
        assert_eq!(
            table.log(),
            "ClearNextLine()\n\
             MoveUp(1)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.build_ended();
        table.update(1370);
        assert_eq!(table.log(), "Flush()\n");
    }

    #[test]
    fn test_proper_command_durations_across_builds() {
        let mut table = test_table(2);
        table.set_status("some_status");
        table.build_started();

        table.command_started(1, 0, description(1));
        table.command_started(2, 250, description(2));
        table.command_started(3, 570, description(3));
        table.update(570);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.5s | command_1)\n\
             PrintOnNextLine(  0.3s | command_2)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );

        table.command_ended(3);
        table.command_ended(2);
        table.command_ended(1);
        table.build_ended();
        let _ = table.log();

        // Second build with a shifted epoch: durations stay relative.
        table.build_started();
        table.command_started(1, 10_000, description(1));
        table.command_started(2, 10_250, description(2));
        table.command_started(3, 10_570, description(3));
        table.update(10_570);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.5s | command_1)\n\
             PrintOnNextLine(  0.3s | command_2)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(some_status)\n\
             Flush()\n"
        );
    }

    #[test]
    fn test_equal_start_times_keep_insertion_order() {
        let mut table = test_table(2);
        table.set_status("s");
        table.build_started();

        // Three commands share one start time but only two fit in the
        // table: the two earliest-inserted must survive selection and stay
        // in insertion order, independent of the pending map's iteration
        // order.
        table.command_started(7, 100, "first".to_string());
        table.command_started(8, 100, "second".to_string());
        table.command_started(9, 100, "third".to_string());

        table.update(100);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.0s | first)\n\
             PrintOnNextLine(  0.0s | second)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(s)\n\
             Flush()\n"
        );

        // Repeated updates keep the same pair in the same order.
        table.update(200);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.1s | first)\n\
             PrintOnNextLine(  0.1s | second)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(s)\n\
             Flush()\n"
        );

        // When the lowest insertion id completes, the next one takes its
        // place, still id-ordered.
        table.command_ended(7);
        table.update(300);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  0.2s | second)\n\
             PrintOnNextLine(  0.2s | third)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(s)\n\
             Flush()\n"
        );
    }

    #[test]
    fn test_minutes_and_skew_formats() {
        let mut table = test_table(2);
        table.set_status("s");
        table.build_started();

        table.command_started(1, 0, "slow".to_string());
        table.update(61_500);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  1m1s | slow)\n\
             MoveUp(1)\n\
             PrintOnCurrentLine(s)\n\
             Flush()\n"
        );

        // A command whose start time is in the caller's future.
        table.command_started(2, 200_000, "future".to_string());
        table.update(61_600);
        assert_eq!(
            table.log(),
            "PrintOnNextLine(  1m1s | slow)\n\
             PrintOnNextLine(?????? | future)\n\
             MoveUp(2)\n\
             PrintOnCurrentLine(s)\n\
             Flush()\n"
        );
    }
}
