//! Vision-based task completion checking.
//!
//! The checker sends the goal plus before/after color and depth frames to a
//! multimodal backend and reads a boolean verdict out of the generated code.

use lmprog_engine::backend::IMAGE_ORDER;
use lmprog_engine::error::io_error;
use lmprog_engine::{
    extract, Error, FixedScope, GenerationOptions, ImageAttachment, InferenceBackend, Namespace,
    PromptTemplate, Result, Sandbox, SharedTranscript,
};
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, info};

/// System message for the multimodal checking backend.
pub const CHECKER_SYSTEM_PROMPT: &str = "You are a task completion checking assistant who compares the final \
     observation with initial observation and gives the judge in rhai code format like \
     'let judge = true;' (or false)";

pub const DEFAULT_VERDICT_NAME: &str = "judge";

pub struct CompletionChecker {
    name: String,
    template: PromptTemplate,
    options: GenerationOptions,
    verdict_name: String,
    debug_mode: bool,
    backend: Rc<dyn InferenceBackend>,
    sandbox: Sandbox,
    transcript: SharedTranscript,
    history: String,
}

impl CompletionChecker {
    pub fn new(
        name: impl Into<String>,
        template: PromptTemplate,
        backend: Rc<dyn InferenceBackend>,
        transcript: SharedTranscript,
    ) -> Self {
        Self {
            name: name.into(),
            template,
            options: GenerationOptions::default(),
            verdict_name: DEFAULT_VERDICT_NAME.to_string(),
            debug_mode: false,
            backend,
            sandbox: Sandbox::new(),
            transcript,
            history: String::new(),
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_verdict_name(mut self, name: impl Into<String>) -> Self {
        self.verdict_name = name.into();
        self
    }

    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Ask whether `query` was completed, given the four observation frames.
    ///
    /// The verdict is the variable named by the checker's verdict name; when
    /// the code never binds it, any literal `true` in the code counts as done.
    pub fn check(&mut self, query: &str, frames: Vec<ImageAttachment>) -> Result<bool> {
        if frames.len() != IMAGE_ORDER.len() {
            return Err(Error::invalid_argument(format!(
                "expected {} frames, got {}",
                IMAGE_ORDER.len(),
                frames.len()
            ))
            .with_operation("checker::check"));
        }

        let (prompt, use_query) = self.template.build(&self.history, "", query, &[]);
        let request = self.options.request(prompt).with_images(frames);
        let reply = self
            .backend
            .generate(&request)
            .map_err(|e| e.with_operation("checker::check").with_context("unit", self.name.clone()))?;
        let code = extract(&reply)?;

        let to_log = format!("{}\n{}", use_query, code);
        self.transcript.borrow_mut().record_executed(&self.name, &reply, &to_log);
        info!(unit = %self.name, "LMP {} exec:\n\n{}", self.name, to_log);

        let verdict = if self.debug_mode {
            None
        } else {
            let empty = Namespace::new(FixedScope::builder().build());
            let execution = self.sandbox.run(&code, &empty, &[])?;
            execution.locals.get(&self.verdict_name).and_then(|v| v.as_bool().ok())
        };

        self.history.push('\n');
        self.history.push_str(&code);

        let done = verdict.unwrap_or_else(|| code.contains("true"));
        debug!(unit = %self.name, done, bound = verdict.is_some(), "completion verdict");
        Ok(done)
    }
}

/// Read the before/after frames from disk, in the order backends expect:
/// color before, depth before, color after, depth after.
pub fn frames_from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<ImageAttachment>> {
    if paths.len() != IMAGE_ORDER.len() {
        return Err(Error::invalid_argument(format!(
            "expected {} image paths, got {}",
            IMAGE_ORDER.len(),
            paths.len()
        ))
        .with_operation("checker::frames_from_files"));
    }

    IMAGE_ORDER
        .iter()
        .zip(paths)
        .map(|(&(kind, phase), path)| {
            let path = path.as_ref();
            let bytes = std::fs::read(path).map_err(|e| io_error(path, e))?;
            Ok(ImageAttachment::jpeg(kind, phase, bytes))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmprog_engine::{GenerateRequest, ImageKind, ImagePhase, Transcript};
    use lmprog_error::ErrorKind;
    use std::cell::RefCell;

    struct FixedReply {
        reply: String,
        seen_images: RefCell<Vec<(ImageKind, ImagePhase)>>,
    }

    impl FixedReply {
        fn new(reply: &str) -> Rc<Self> {
            Rc::new(Self {
                reply: reply.to_string(),
                seen_images: RefCell::new(Vec::new()),
            })
        }
    }

    impl InferenceBackend for FixedReply {
        fn generate(&self, request: &GenerateRequest) -> Result<String> {
            self.seen_images
                .borrow_mut()
                .extend(request.images.iter().map(|i| (i.kind, i.phase)));
            Ok(self.reply.clone())
        }
    }

    fn frames() -> Vec<ImageAttachment> {
        IMAGE_ORDER
            .iter()
            .map(|&(kind, phase)| ImageAttachment::jpeg(kind, phase, vec![0xff, 0xd8]))
            .collect()
    }

    fn make_checker(backend: Rc<FixedReply>) -> (CompletionChecker, SharedTranscript) {
        let transcript = Transcript::shared();
        let checker = CompletionChecker::new(
            "vision_check",
            PromptTemplate::new("// judge the task").with_query_decoration("// ", "."),
            backend,
            transcript.clone(),
        );
        (checker, transcript)
    }

    #[test]
    fn test_bound_verdict() {
        let backend = FixedReply::new("```rhai\nlet judge = false;\n// true would need the block moved\n```");
        let (mut checker, transcript) = make_checker(backend.clone());

        assert!(!checker.check("put the red block in the bowl", frames()).unwrap());
        assert_eq!(backend.seen_images.borrow().as_slice(), &IMAGE_ORDER);
        assert!(transcript.borrow().text().contains("LMP vision_check exec:"));
        assert!(transcript.borrow().text().contains("// put the red block in the bowl."));
    }

    #[test]
    fn test_fallback_to_literal() {
        let (mut checker, _) = make_checker(FixedReply::new("let done = true;"));
        assert!(checker.check("stack the blocks", frames()).unwrap());

        let (mut checker, _) = make_checker(FixedReply::new("let done = false;"));
        assert!(!checker.check("stack the blocks", frames()).unwrap());
    }

    #[test]
    fn test_custom_verdict_name() {
        let (checker, _) = make_checker(FixedReply::new("let finished = true;\nlet judge = false;"));
        let mut checker = checker.with_verdict_name("finished");
        assert!(checker.check("stack the blocks", frames()).unwrap());
    }

    #[test]
    fn test_debug_mode_skips_execution() {
        let (checker, _) = make_checker(FixedReply::new("let judge = false; this is not rhai"));
        let mut checker = checker.with_debug_mode(true);
        assert!(!checker.check("stack the blocks", frames()).unwrap());
    }

    #[test]
    fn test_wrong_frame_count() {
        let (mut checker, _) = make_checker(FixedReply::new("let judge = true;"));
        let err = checker.check("stack the blocks", frames()[..2].to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_frames_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = ["rgb0.jpg", "depth0.jpg", "rgb1.jpg", "depth1.jpg"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let path = dir.path().join(name);
                std::fs::write(&path, [i as u8]).unwrap();
                path
            })
            .collect();

        let frames = frames_from_files(&paths).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!((frames[1].kind, frames[1].phase), (ImageKind::Depth, ImagePhase::Before));
        assert_eq!(frames[2].bytes, vec![2]);

        let missing = frames_from_files(&[dir.path().join("nope.jpg")]).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::InvalidArgument);
    }
}
