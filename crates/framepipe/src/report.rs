use std::fmt::Write as _;

use pipeline::Director;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub elapsed_ms: u64,
    pub seed: u64,
    pub windows: Vec<WindowReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frames_presented: u64,
    pub frames_failed: u64,
    pub frames_cancelled: u64,
    pub swapchain_recreations: u64,
    pub frames_rendered: u64,
    pub frames_rejected: u64,
    pub fps: f32,
    pub avg_fps: f32,
    pub spf_ms: f32,
    pub fence_ms: f32,
    pub timestamp_ms: f32,
    pub director_ms: f32,
    pub draw_calls: u32,
}

impl WindowReport {
    pub fn from_director(name: &str, director: &Director) -> Self {
        let stats = director.stats();
        let constraints = director.constraints();
        Self {
            name: name.to_string(),
            width: constraints.extent.width,
            height: constraints.extent.height,
            frames_presented: stats.frames_presented,
            frames_failed: stats.frames_failed,
            frames_cancelled: stats.frames_cancelled,
            swapchain_recreations: stats.swapchain_recreations,
            frames_rendered: director.frames_rendered(),
            frames_rejected: director.frames_rejected(),
            fps: stats.fps(),
            avg_fps: stats.avg_fps(),
            spf_ms: stats.spf(),
            fence_ms: stats.fence_frame_time(),
            timestamp_ms: stats.timestamp_frame_time(),
            director_ms: director.director_frame_time(),
            draw_calls: director.draw_stat().draw_calls,
        }
    }
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "framepipe: {} window(s) in {} ms (seed {})",
            self.windows.len(),
            self.elapsed_ms,
            self.seed
        );
        for window in &self.windows {
            let _ = writeln!(
                out,
                "  {:<12} {}x{} presented={} failed={} cancelled={} recreated={}",
                window.name,
                window.width,
                window.height,
                window.frames_presented,
                window.frames_failed,
                window.frames_cancelled,
                window.swapchain_recreations
            );
            let _ = writeln!(
                out,
                "  {:<12} fps={:.1} avg_fps={:.1} spf={:.2}ms fence={:.2}ms gpu={:.2}ms director={:.3}ms draws={}",
                "",
                window.fps,
                window.avg_fps,
                window.spf_ms,
                window.fence_ms,
                window.timestamp_ms,
                window.director_ms,
                window.draw_calls
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        RunReport {
            elapsed_ms: 420,
            seed: 7,
            windows: vec![WindowReport {
                name: "main".into(),
                width: 1024,
                height: 768,
                frames_presented: 30,
                frames_failed: 0,
                frames_cancelled: 1,
                swapchain_recreations: 1,
                frames_rendered: 30,
                frames_rejected: 1,
                fps: 60.0,
                avg_fps: 59.5,
                spf_ms: 2.1,
                fence_ms: 2.0,
                timestamp_ms: 1.2,
                director_ms: 0.05,
                draw_calls: 2,
            }],
        }
    }

    #[test]
    fn text_report_lists_every_window() {
        let text = report().render_text();
        assert!(text.starts_with("framepipe: 1 window(s) in 420 ms (seed 7)"));
        assert!(text.contains("main"));
        assert!(text.contains("presented=30"));
        assert!(text.contains("1024x768"));
    }

    #[test]
    fn json_report_uses_field_names() {
        let value: serde_json::Value = serde_json::from_str(&report().to_json().unwrap()).unwrap();
        assert_eq!(value["seed"], 7);
        assert_eq!(value["windows"][0]["name"], "main");
        assert_eq!(value["windows"][0]["frames_presented"], 30);
    }
}
