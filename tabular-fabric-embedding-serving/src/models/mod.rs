pub mod sparse_embedding_bag;
