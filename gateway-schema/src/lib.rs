pub mod codeassist;
pub mod gemini;
pub mod openai;
pub mod translate;

pub use codeassist::{CodeAssistRequest, CodeAssistRequestMeta, CodeAssistResponseBody};
pub use gemini::{GeminiGenerateContentRequest, GeminiModelList, GeminiResponseBody};
pub use openai::{OpenaiChatRequest, OpenaiChatResponse, OpenaiModelList};
pub use translate::{gemini_to_openai_response, openai_to_gemini};
