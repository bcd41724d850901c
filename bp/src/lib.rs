pub use bp_file::*;
pub use {
    bp_aggregator as aggregator, bp_comm as comm, bp_error as error, bp_file as file,
    bp_io as io,
};
