//! Worker fixture: serves the example handlers over stdin/stdout.

use std::process::ExitCode;

mod handlers;

use handlers::{
    add, add_numpy_arrays, add_scalar_output, identity, verify_1d_array, verify_1d_int32_array,
    verify_2d_array,
};

fn main() -> ExitCode {
    let registry = match callbridge::handlers![
        add,
        add_scalar_output,
        add_numpy_arrays,
        identity,
        verify_2d_array,
        verify_1d_array,
        verify_1d_int32_array,
    ] {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match callbridge::execute(registry) {
        Ok(stats) => {
            tracing::debug!(?stats, "Fixture worker done");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
