//! Concrete operations.
//!
//! | kind         | arity                 | capabilities             |
//! |--------------|-----------------------|--------------------------|
//! | `linear`     | single                | parameters, device, fuse |
//! | `activation` | single                | device, fusion target    |
//! | `add`, `mul` | dual                  |                          |
//! | `add_n`      | multi                 |                          |
//! | `split`      | single in, multi out  |                          |
//! | `concat`     | dual                  |                          |
//! | `sum`        | single                |                          |
//! | `broadcast`  | single                |                          |

/// `core`/`core_mut` for operations storing their `FunctionCore` in `self.core`.
macro_rules! core_accessors {
    () => {
        fn core(&self) -> &FunctionCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut FunctionCore {
            &mut self.core
        }
    };
}

pub mod activation;
pub mod arithmetic;
pub mod linear;
pub mod structural;

pub use activation::{Activation, ActivationKind};
pub use arithmetic::{Add, AddN, Mul};
pub use linear::Linear;
pub use structural::{Broadcast, Concat, SplitAxis, SumAxes};
