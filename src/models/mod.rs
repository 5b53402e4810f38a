pub mod cnn_gru;
