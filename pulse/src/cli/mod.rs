pub mod args;

pub use args::{Args, Command, ModeArg, SampleArgs, TargetArgs, TraceArgs};
