use core::fmt;

use crate::{
    engine::Engine,
    monitor::Monitor,
    node::{AllocChunk, Chunk},
};

/// One line of a live-allocation dump.
pub(crate) struct DumpLine<'a, M: Monitor>(pub &'a AllocChunk<M::Stamp>);

impl<M: Monitor> fmt::Display for DumpLine<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chunk = self.0;
        write!(f, "{:#014x} {:>8}", chunk.addr, chunk.size)?;

        if let Some(owner) = M::owner(&chunk.stamp) {
            write!(f, " task {owner}")?;
        }
        if let Some(caller) = M::caller(&chunk.stamp) {
            write!(f, " {}:{}", caller.file(), caller.line())?;
        }

        Ok(())
    }
}

/// Writes one line per allocated chunk followed by a summary line.
pub(crate) fn dump_live<M: Monitor>(
    engine: &Engine<M::Stamp>,
    out: &mut dyn fmt::Write,
) -> fmt::Result {
    let mut result = Ok(());
    let mut count = 0;
    let mut bytes = 0;

    engine.walk(|chunk| {
        if let Chunk::Alloc(chunk) = chunk {
            count += 1;
            bytes += chunk.size;
            if result.is_ok() {
                result = writeln!(out, "{}", DumpLine::<M>(&chunk));
            }
        }
    });

    result?;
    writeln!(out, "{count} live allocations, {bytes} bytes")
}

#[cfg(test)]
mod tests {
    use core::panic::Location;

    use super::*;
    use crate::{diag::Recorder, lock::TaskId, monitor::Quiet};

    #[test]
    fn quiet_line_has_address_and_size() {
        let chunk = AllocChunk { addr: 0x1000, size: 96, stamp: () };
        let line = DumpLine::<Quiet>(&chunk).to_string();

        assert_eq!(line, "0x000000001000       96");
    }

    #[test]
    fn recorded_line_names_owner_and_caller() {
        let caller = Location::caller();
        let stamp = Recorder::new().stamp(TaskId(7), caller);
        let chunk = AllocChunk { addr: 0x1000, size: 96, stamp };
        let line = DumpLine::<Recorder>(&chunk).to_string();

        assert!(line.contains(" task 7 "));
        assert!(line.ends_with(&format!("{}:{}", caller.file(), caller.line())));
    }
}
