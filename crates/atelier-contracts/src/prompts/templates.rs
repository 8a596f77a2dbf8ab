use serde::Serialize;

const DOC_HIGHLIGHT_MAX_CHARS: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoTemplate {
    pub name: &'static str,
    pub platform: &'static str,
    pub duration_s: u32,
    pub motion: &'static str,
    pub lighting: &'static str,
    pub style: &'static str,
    pub ratio: &'static str,
}

pub const VIDEO_TEMPLATES: &[VideoTemplate] = &[
    VideoTemplate {
        name: "Amazon Hero 6s",
        platform: "Amazon",
        duration_s: 6,
        motion: "slow push in",
        lighting: "studio soft light",
        style: "clean premium",
        ratio: "1:1",
    },
    VideoTemplate {
        name: "Taobao Fast Hook 3s",
        platform: "Taobao",
        duration_s: 3,
        motion: "fast dynamic move",
        lighting: "bright commercial",
        style: "high contrast",
        ratio: "1:1",
    },
    VideoTemplate {
        name: "Luxury Studio 8s",
        platform: "Amazon",
        duration_s: 8,
        motion: "cinematic rotate",
        lighting: "dramatic shadow",
        style: "luxury high-end",
        ratio: "16:9",
    },
    VideoTemplate {
        name: "Japanese Minimal 6s",
        platform: "Amazon JP",
        duration_s: 6,
        motion: "gentle push",
        lighting: "natural soft",
        style: "minimal japanese",
        ratio: "1:1",
    },
    VideoTemplate {
        name: "Functional Showcase 12s",
        platform: "Taobao",
        duration_s: 12,
        motion: "multi-angle",
        lighting: "neutral",
        style: "product focus",
        ratio: "16:9",
    },
    VideoTemplate {
        name: "360 Product Spin",
        platform: "Universal",
        duration_s: 6,
        motion: "360 rotation",
        lighting: "studio",
        style: "clear",
        ratio: "1:1",
    },
];

pub const DEFAULT_VIDEO_RATIO: &str = "16:9";
pub const DEFAULT_VIDEO_DURATION_S: u32 = 10;

/// Case-insensitive lookup by template name.
pub fn find_template(name: &str) -> Option<&'static VideoTemplate> {
    let wanted = name.trim();
    VIDEO_TEMPLATES
        .iter()
        .find(|template| template.name.eq_ignore_ascii_case(wanted))
}

pub fn build_video_prompt(template: &VideoTemplate, product_desc: &str, market: &str) -> String {
    [
        "A professional product commercial video.".to_string(),
        format!("Product: {product_desc}"),
        format!("Market: {market}"),
        format!("Camera motion: {}", template.motion),
        format!("Lighting: {}", template.lighting),
        format!("Style: {}", template.style),
        "High detail, realistic, 4K, commercial advertisement.".to_string(),
    ]
    .join("\n")
}

/// Closes a video prompt with its aspect ratio and duration lines.
pub fn with_render_settings(prompt: &str, ratio: &str, duration_s: u32) -> String {
    format!("{prompt}\nAspect ratio: {ratio}\nDuration: {duration_s}s")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductBrief {
    pub name: String,
    pub category: String,
    pub market: String,
    pub price_tier: String,
    pub style_tags: Vec<String>,
    pub custom_motion: String,
    pub mood: String,
    pub shot_list: String,
    pub doc_text: String,
}

/// Template prompt followed by the product fields and a capped document excerpt.
pub fn compose_video_brief(template: &VideoTemplate, brief: &ProductBrief) -> String {
    let style_tags = if brief.style_tags.is_empty() {
        "N/A".to_string()
    } else {
        brief.style_tags.join(", ")
    };
    let highlights = brief
        .doc_text
        .chars()
        .take(DOC_HIGHLIGHT_MAX_CHARS)
        .collect::<String>();
    format!(
        "{}\nProduct name: {}\nCategory: {}\nPrice tier: {}\nStyle tags: {}\nCustom motion: {}\nMood: {}\nShot list:\n{}\nDoc highlights: {}",
        build_video_prompt(template, &brief.name, &brief.market),
        brief.name,
        brief.category,
        brief.price_tier,
        style_tags,
        brief.custom_motion,
        brief.mood,
        brief.shot_list,
        highlights,
    )
}
