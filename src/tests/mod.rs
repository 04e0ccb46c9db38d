//! Host-side tests running against a mock HAL and mock guest memory.


mod fault;
mod walker;
