mod model_list;
mod request;
mod response;

pub use model_list::{OpenaiModel, OpenaiModelList};
pub use request::{OpenaiChatMessage, OpenaiChatRequest};
pub use response::{
    OpenaiChatChoice, OpenaiChatChoiceMessage, OpenaiChatChunk, OpenaiChatChunkChoice,
    OpenaiChatChunkDelta, OpenaiChatResponse, OpenaiUsage,
};
