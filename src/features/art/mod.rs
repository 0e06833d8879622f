mod renderer;

pub use renderer::{
    CHAR_ASPECT, CHARSET, DEFAULT_GRID_LIMIT, DEFAULT_WIDTH, GridLimit, RenderMode, RenderOptions,
    render, target_dimensions,
};
