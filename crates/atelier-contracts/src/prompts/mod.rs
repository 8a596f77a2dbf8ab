mod templates;

pub use templates::{
    build_video_prompt, compose_video_brief, find_template, with_render_settings, ProductBrief,
    VideoTemplate, DEFAULT_VIDEO_DURATION_S, DEFAULT_VIDEO_RATIO, VIDEO_TEMPLATES,
};
